//! A single version of the updatable software and its pipeline.
//!
//! A [`Release`] moves through `Empty → Fetched → Downloaded → Extracted →
//! Verified → Installed → Launched`. Every stage is single-flight: callers
//! that arrive while a stage is running await the same outcome. Stage work is
//! spawned on the runtime, so it finishes even when every caller is dropped.

mod stages;
mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::{AssetError, CacheError, MetadataError, ReleaseError};
use crate::events::{EventSink, FeedEvent};
use crate::feed::Capabilities;
use crate::single_flight::SingleFlight;
use crate::source::{AssetDescriptor, Candidate, Eligibility, MetadataSource};
use crate::store::{AssetStore, ReleaseRecord};

pub use state::{ReleaseState, Stage, StageReport};

type StageOutcome = Result<StageReport, ReleaseError>;

/// Everything a release needs from its feed.
pub(crate) struct ReleaseContext {
    pub(crate) store: Arc<AssetStore>,
    pub(crate) capabilities: Capabilities,
    pub(crate) source: MetadataSource,
    pub(crate) eligibility: Eligibility,
    pub(crate) require_identity_match: bool,
    pub(crate) events: EventSink,
}

#[derive(Debug, Clone, Default)]
struct ReleaseData {
    version: Option<String>,
    prerelease: bool,
    assets: Vec<AssetDescriptor>,
    state: ReleaseState,
    downloaded: BTreeMap<String, PathBuf>,
    extracted: BTreeMap<String, PathBuf>,
    verified: BTreeMap<String, PathBuf>,
    failed: BTreeMap<String, AssetError>,
}

#[derive(Default)]
struct Flights {
    fetch: SingleFlight<StageOutcome>,
    download: SingleFlight<StageOutcome>,
    extract: SingleFlight<StageOutcome>,
    verify: SingleFlight<StageOutcome>,
    install: SingleFlight<StageOutcome>,
}

struct ReleaseInner {
    repository: String,
    context: Arc<ReleaseContext>,
    data: Mutex<ReleaseData>,
    flights: Flights,
}

/// Shared handle to one release. Clones refer to the same release.
#[derive(Clone)]
pub struct Release {
    inner: Arc<ReleaseInner>,
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("Release")
            .field("repository", &self.inner.repository)
            .field("version", &data.version)
            .field("state", &data.state)
            .finish_non_exhaustive()
    }
}

impl Release {
    fn with_data(repository: &str, context: Arc<ReleaseContext>, data: ReleaseData) -> Self {
        Self {
            inner: Arc::new(ReleaseInner {
                repository: repository.to_string(),
                context,
                data: Mutex::new(data),
                flights: Flights::default(),
            }),
        }
    }

    /// A freshly discovered release, persisted as `Fetched`.
    pub(crate) fn from_candidate(
        repository: &str,
        context: Arc<ReleaseContext>,
        candidate: Candidate,
    ) -> Result<Self, CacheError> {
        let data = ReleaseData {
            version: Some(candidate.version),
            prerelease: candidate.prerelease,
            assets: candidate.assets,
            state: ReleaseState::Fetched,
            ..ReleaseData::default()
        };
        if let Some(record) = record_of(repository, &data) {
            context.store.persist(&record)?;
        }
        Ok(Self::with_data(repository, context, data))
    }

    /// Rebuild a release from its state marker.
    ///
    /// Entries whose artifacts vanished from disk are dropped and the state
    /// is lowered to the last stage the remaining artifacts still satisfy.
    pub(crate) fn rehydrate(context: Arc<ReleaseContext>, record: ReleaseRecord) -> Self {
        let repository = record.repository.clone();
        let recorded = record.state;
        let data = clamp(record);
        if data.state != recorded {
            warn!(
                "Cached release {repository} {} resumes at {} instead of {recorded}",
                data.version.as_deref().unwrap_or_default(),
                data.state
            );
        }
        Self::with_data(&repository, context, data)
    }

    fn data(&self) -> MutexGuard<'_, ReleaseData> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn context(&self) -> &ReleaseContext {
        &self.inner.context
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        &self.inner.repository
    }

    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.data().version.clone()
    }

    #[must_use]
    pub fn prerelease(&self) -> bool {
        self.data().prerelease
    }

    #[must_use]
    pub fn assets(&self) -> Vec<AssetDescriptor> {
        self.data().assets.clone()
    }

    #[must_use]
    pub fn state(&self) -> ReleaseState {
        self.data().state
    }

    /// Remote locator → downloaded file, for assets that downloaded.
    #[must_use]
    pub fn downloaded_assets(&self) -> BTreeMap<String, PathBuf> {
        self.data().downloaded.clone()
    }

    /// Remote locator → extracted artifact, for assets that extracted.
    #[must_use]
    pub fn extracted_assets(&self) -> BTreeMap<String, PathBuf> {
        self.data().extracted.clone()
    }

    /// Install target name → artifact that passed verification.
    #[must_use]
    pub fn verified_artifacts(&self) -> BTreeMap<String, PathBuf> {
        self.data().verified.clone()
    }

    /// Failures of the most recently attempted stage.
    #[must_use]
    pub fn failed_assets(&self) -> BTreeMap<String, AssetError> {
        self.data().failed.clone()
    }

    #[must_use]
    pub fn cache_location(&self) -> Option<PathBuf> {
        let version = self.version()?;
        Some(
            self.context()
                .store
                .location_for(&self.inner.repository, &version),
        )
    }

    /// True while any stage of this release is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let flights = &self.inner.flights;
        flights.fetch.is_running()
            || flights.download.is_running()
            || flights.extract.is_running()
            || flights.verify.is_running()
            || flights.install.is_running()
    }

    /// Populate version and assets from the release index.
    ///
    /// A release that already carries a version only accepts upstream
    /// metadata for that same version. Calling it on a fetched release is a
    /// no-op.
    ///
    /// # Errors
    /// Returns [`ReleaseError::Metadata`] when the index cannot be read or
    /// has no matching release.
    pub async fn fetch(&self) -> StageOutcome {
        self.run_stage(Stage::Fetch, Self::fetch_metadata).await
    }

    /// Download every asset not downloaded yet, concurrently.
    ///
    /// # Errors
    /// Returns [`ReleaseError::Transfer`] with the full report when any asset
    /// failed; assets that succeeded stay cached for the retry.
    pub async fn download(&self) -> StageOutcome {
        self.run_stage(Stage::Download, Self::download_assets).await
    }

    /// Unpack downloaded archives; other assets pass through unchanged.
    ///
    /// # Errors
    /// Returns [`ReleaseError::Extraction`] with the full report when any
    /// asset failed to unpack.
    pub async fn extract(&self) -> StageOutcome {
        self.run_stage(Stage::Extract, Self::extract_assets).await
    }

    /// Check the signature of every installable unit.
    ///
    /// # Errors
    /// Returns [`ReleaseError::Verification`] when any unit is missing,
    /// unsigned, untrusted or signed by a different identity than the
    /// installed unit. The release stays `Extracted`.
    pub async fn verify(&self) -> StageOutcome {
        self.run_stage(Stage::Verify, Self::verify_artifacts).await
    }

    /// Replace every install target with its verified artifact, all or
    /// nothing.
    ///
    /// # Errors
    /// Returns [`ReleaseError::Install`] when any target could not be
    /// replaced; the installation is then left as it was.
    pub async fn install(&self) -> StageOutcome {
        self.run_stage(Stage::Install, Self::install_artifacts).await
    }

    /// Delete every cached artifact of this release and reset it to
    /// `Empty`.
    ///
    /// # Errors
    /// Fails when the release backs the active installation, a stage holds
    /// its cache directory, or the directory cannot be removed.
    pub fn clear(&self) -> Result<(), ReleaseError> {
        let mut data = self.data();
        if let Some(version) = data.version.clone() {
            self.context()
                .store
                .erase(&self.inner.repository, &version)?;
        }
        let previous = data.state;
        data.state = ReleaseState::Empty;
        data.downloaded.clear();
        data.extracted.clear();
        data.verified.clear();
        data.failed.clear();
        let version = data.version.clone();
        drop(data);

        if previous != ReleaseState::Empty
            && let Some(version) = version
        {
            info!("Cleared release {} {version}", self.inner.repository);
            self.context().events.emit(FeedEvent::StateChanged {
                version,
                state: ReleaseState::Empty,
            });
        }
        Ok(())
    }

    /// Record that the host relaunched into this installed release.
    pub(crate) fn mark_launched(&self) -> Result<(), ReleaseError> {
        self.update(|data| {
            if data.state == ReleaseState::Installed {
                data.state = ReleaseState::Launched;
            }
        })
    }

    async fn run_stage<F, Fut>(&self, stage: Stage, work: F) -> StageOutcome
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = StageOutcome> + Send + 'static,
    {
        let flight = match stage {
            Stage::Fetch => &self.inner.flights.fetch,
            Stage::Download => &self.inner.flights.download,
            Stage::Extract => &self.inner.flights.extract,
            Stage::Verify => &self.inner.flights.verify,
            Stage::Install => &self.inner.flights.install,
        };

        let release = self.clone();
        let outcome = flight
            .run(move || {
                let reporter = release.clone();
                let work = work(release);
                async move {
                    let outcome = work.await;
                    if let Err(error) = &outcome {
                        reporter.report_failure(error);
                    }
                    outcome
                }
            })
            .await;

        outcome.unwrap_or_else(|aborted| {
            Err(ReleaseError::Aborted {
                stage,
                details: aborted.to_string(),
            })
        })
    }

    fn report_failure(&self, error: &ReleaseError) {
        warn!(
            "Release {} {}: {error}",
            self.inner.repository,
            self.version().unwrap_or_default()
        );
        self.context().events.emit(FeedEvent::StageFailed {
            version: self.version(),
            error: error.clone(),
        });
    }

    /// Check `stage` may run now. `Ok(Some(report))` means it already
    /// completed and nothing is left to do.
    fn admit(&self, stage: Stage) -> Result<Option<StageReport>, ReleaseError> {
        let data = self.data();
        if data.state >= stage.completes() {
            debug!("{stage} already completed, state is {}", data.state);
            return Ok(Some(recorded_report(stage, &data)));
        }
        if data.state < stage.requires() {
            return Err(ReleaseError::Precondition {
                stage,
                required: stage.requires(),
                actual: data.state,
            });
        }
        Ok(None)
    }

    /// Apply `change`, persist the result and only then publish it.
    ///
    /// A failed write leaves the in-memory release untouched.
    fn update(&self, change: impl FnOnce(&mut ReleaseData)) -> Result<(), ReleaseError> {
        let mut data = self.data();
        let mut next = data.clone();
        change(&mut next);

        if let Some(record) = record_of(&self.inner.repository, &next) {
            self.context().store.persist(&record)?;
        }

        let advanced = (next.state != data.state).then_some(next.state);
        let version = next.version.clone();
        *data = next;
        drop(data);

        if let (Some(state), Some(version)) = (advanced, version) {
            info!("Release {} {version} is now {state}", self.inner.repository);
            self.context()
                .events
                .emit(FeedEvent::StateChanged { version, state });
        }
        Ok(())
    }

    async fn fetch_metadata(self) -> StageOutcome {
        if let Some(report) = self.admit(Stage::Fetch)? {
            return Ok(report);
        }
        let context = self.context();
        let candidate = context
            .source
            .fetch(
                context.capabilities.http.as_ref(),
                &self.inner.repository,
                &context.eligibility,
            )
            .await?
            .ok_or_else(|| MetadataError::NoEligibleRelease {
                repository: self.inner.repository.clone(),
            })?;

        if let Some(expected) = self.version()
            && expected != candidate.version
        {
            return Err(MetadataError::VersionMismatch {
                expected,
                found: candidate.version,
            }
            .into());
        }

        self.update(|data| {
            data.version = Some(candidate.version);
            data.prerelease = candidate.prerelease;
            data.assets = candidate.assets;
            data.state = ReleaseState::Fetched;
            data.failed.clear();
        })?;
        Ok(StageReport::new(Stage::Fetch))
    }
}

fn record_of(repository: &str, data: &ReleaseData) -> Option<ReleaseRecord> {
    Some(ReleaseRecord {
        repository: repository.to_string(),
        version: data.version.clone()?,
        prerelease: data.prerelease,
        state: data.state,
        assets: data.assets.clone(),
        downloaded: data.downloaded.clone(),
        extracted: data.extracted.clone(),
        verified: data.verified.clone(),
        updated_at: Utc::now(),
    })
}

fn recorded_report(stage: Stage, data: &ReleaseData) -> StageReport {
    let mut report = StageReport::new(stage);
    report.succeeded = match stage {
        Stage::Fetch => BTreeMap::new(),
        Stage::Download => data.downloaded.clone(),
        Stage::Extract => data.extracted.clone(),
        Stage::Verify | Stage::Install => data.verified.clone(),
    };
    report
}

fn clamp(record: ReleaseRecord) -> ReleaseData {
    let keep_existing = |entries: BTreeMap<String, PathBuf>| -> BTreeMap<String, PathBuf> {
        entries
            .into_iter()
            .filter(|(_, path)| path.exists())
            .collect()
    };

    let mut data = ReleaseData {
        version: Some(record.version),
        prerelease: record.prerelease,
        state: record.state,
        downloaded: keep_existing(record.downloaded),
        extracted: keep_existing(record.extracted),
        verified: keep_existing(record.verified),
        assets: record.assets,
        failed: BTreeMap::new(),
    };

    if data.state >= ReleaseState::Installed {
        return data;
    }
    let all_downloaded = data
        .assets
        .iter()
        .all(|asset| data.downloaded.contains_key(&asset.url));
    let all_extracted = data
        .downloaded
        .keys()
        .all(|url| data.extracted.contains_key(url));

    if data.state >= ReleaseState::Downloaded && !all_downloaded {
        data.state = ReleaseState::Fetched;
    }
    if data.state >= ReleaseState::Extracted && !all_extracted {
        data.state = ReleaseState::Downloaded;
    }
    if data.state >= ReleaseState::Verified && data.verified.is_empty() {
        data.state = ReleaseState::Extracted;
    }
    data
}
