mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use common::{CountingVerifier, Harness, REPOSITORY};
use updraft_core::{CacheError, FeedError, ReleaseRecord, ReleaseState};

fn cached(harness: &Harness, version: &str) {
    let record = ReleaseRecord {
        repository: REPOSITORY.to_string(),
        version: version.to_string(),
        prerelease: false,
        state: ReleaseState::Fetched,
        assets: Vec::new(),
        downloaded: BTreeMap::new(),
        extracted: BTreeMap::new(),
        verified: BTreeMap::new(),
        updated_at: Utc::now(),
    };
    harness
        .feed
        .store()
        .persist(&record)
        .expect("record should persist");
}

#[tokio::test]
async fn clears_this_and_prior_releases_and_reports_each_failure() {
    let harness = Harness::new(&[], Arc::new(CountingVerifier::default()));
    for version in ["1.0.0", "2.0.0", "3.0.0", "4.0.0"] {
        cached(&harness, version);
    }
    let release = harness.publish_and_check("3.0.0", &[]).await;
    let store = harness.feed.store();
    let lease = store.lease(&store.location_for(REPOSITORY, "2.0.0"));

    let error = harness
        .feed
        .clear_this_and_prior_releases(&release)
        .expect_err("the leased release should fail to erase");

    assert_eq!(
        error,
        FeedError::Eviction {
            erased: vec!["1.0.0".to_string(), "3.0.0".to_string()],
            failures: BTreeMap::from([(
                "2.0.0".to_string(),
                CacheError::InUse {
                    version: "2.0.0".to_string(),
                },
            )]),
        }
    );
    assert_eq!(
        store
            .list_cached_versions(REPOSITORY)
            .expect("cache should be listable"),
        vec!["2.0.0".to_string(), "4.0.0".to_string()]
    );
    assert_eq!(release.state(), ReleaseState::Empty);
    assert!(harness.feed.current_release().is_none());

    drop(lease);
    let erased = harness
        .feed
        .clear_this_and_prior_releases(&release)
        .expect("the released lease should allow erasing");
    assert_eq!(erased, vec!["2.0.0".to_string()]);
}

#[tokio::test]
async fn versions_are_ordered_by_scheme_not_lexically() {
    let harness = Harness::new(&[], Arc::new(CountingVerifier::default()));
    for version in ["2.0.0", "10.0.0", "9.1.0"] {
        cached(&harness, version);
    }
    let release = harness.publish_and_check("9.1.0", &[]).await;

    let erased = harness
        .feed
        .clear_this_and_prior_releases(&release)
        .expect("eviction should succeed");

    assert_eq!(erased, vec!["2.0.0".to_string(), "9.1.0".to_string()]);
    assert_eq!(
        harness
            .feed
            .store()
            .list_cached_versions(REPOSITORY)
            .expect("cache should be listable"),
        vec!["10.0.0".to_string()]
    );
}

#[tokio::test]
async fn active_installation_is_never_evicted() {
    let harness =
        Harness::with_installed(&[], Arc::new(CountingVerifier::default()), Some("1.0.0"));
    for version in ["1.0.0", "1.5.0"] {
        cached(&harness, version);
    }
    let release = harness.publish_and_check("2.0.0", &[]).await;

    let error = harness
        .feed
        .clear_this_and_prior_releases(&release)
        .expect_err("the active release should be kept");

    let FeedError::Eviction { erased, failures } = error else {
        panic!("expected an eviction error");
    };
    assert_eq!(erased, vec!["1.5.0".to_string(), "2.0.0".to_string()]);
    assert!(matches!(failures.get("1.0.0"), Some(CacheError::Active { .. })));
}
