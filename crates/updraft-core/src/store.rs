//! On-disk release cache.
//!
//! Layout under the cache base:
//!
//! ```text
//! <base>/<repository>/feed.json                 last successful check
//! <base>/<repository>/<version>/release.json    state marker
//! <base>/<repository>/<version>/downloads/…     raw assets
//! <base>/<repository>/<version>/extracted/…     unpacked artifacts
//! ```
//!
//! Markers are written with a temp-file-then-rename discipline so a crash
//! leaves either the previous or the new record on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::atomic::{TEMP_SUFFIX, remove_path, write_atomic};
use crate::error::CacheError;
use crate::release::ReleaseState;
use crate::source::AssetDescriptor;

const MARKER_FILE: &str = "release.json";
const FEED_FILE: &str = "feed.json";
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

/// Persisted view of a release, enough to resume its pipeline after a
/// restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub repository: String,
    pub version: String,
    #[serde(default)]
    pub prerelease: bool,
    pub state: ReleaseState,
    #[serde(default)]
    pub assets: Vec<AssetDescriptor>,
    #[serde(default)]
    pub downloaded: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub extracted: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub verified: BTreeMap<String, PathBuf>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FeedRecord {
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
}

/// Holds a release's cache directory in use; erasing it fails while any
/// lease is alive.
#[derive(Debug)]
pub struct CacheLease {
    location: PathBuf,
    leases: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(count) = leases.get_mut(&self.location) {
            *count -= 1;
            if *count == 0 {
                leases.remove(&self.location);
            }
        }
    }
}

#[derive(Debug)]
pub struct AssetStore {
    base: PathBuf,
    leases: Arc<Mutex<HashMap<PathBuf, usize>>>,
    active: Mutex<HashSet<PathBuf>>,
}

impl AssetStore {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            leases: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn repository_dir(&self, repository: &str) -> PathBuf {
        self.base.join(escape_component(repository))
    }

    /// Cache directory of one release. Distinct versions of a repository
    /// never share a directory.
    #[must_use]
    pub fn location_for(&self, repository: &str, version: &str) -> PathBuf {
        self.repository_dir(repository).join(escape_component(version))
    }

    /// Write the state marker for `record`.
    ///
    /// # Errors
    /// Returns an error if the cache directory or marker cannot be written.
    pub fn persist(&self, record: &ReleaseRecord) -> Result<(), CacheError> {
        let location = self.location_for(&record.repository, &record.version);
        std::fs::create_dir_all(&location).map_err(|error| CacheError::io(&location, &error))?;

        let marker = location.join(MARKER_FILE);
        let data = serde_json::to_vec_pretty(record).map_err(|error| CacheError::Corrupt {
            path: marker.display().to_string(),
            details: error.to_string(),
        })?;
        write_atomic(&marker, &data).map_err(|error| CacheError::io(&marker, &error))?;
        debug!(
            "Persisted {} {} as {}",
            record.repository, record.version, record.state
        );
        Ok(())
    }

    /// Read the state marker of a cached release, if one exists.
    ///
    /// # Errors
    /// Returns an error if the marker exists but cannot be read or parsed.
    pub fn load(
        &self,
        repository: &str,
        version: &str,
    ) -> Result<Option<ReleaseRecord>, CacheError> {
        let marker = self.location_for(repository, version).join(MARKER_FILE);
        read_marker(&marker)
    }

    /// Last completed state of a release, `Empty` if nothing is cached.
    ///
    /// # Errors
    /// Returns an error if the marker exists but cannot be read or parsed.
    pub fn load_state(&self, repository: &str, version: &str) -> Result<ReleaseState, CacheError> {
        Ok(self
            .load(repository, version)?
            .map_or(ReleaseState::Empty, |record| record.state))
    }

    /// Versions with a state marker under the repository's cache directory.
    ///
    /// # Errors
    /// Returns an error if the repository directory cannot be listed.
    pub fn list_cached_versions(&self, repository: &str) -> Result<Vec<String>, CacheError> {
        let dir = self.repository_dir(repository);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(CacheError::io(&dir, &error)),
        };

        let mut versions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_marker(&path.join(MARKER_FILE)) {
                Ok(Some(record)) if record.repository == repository => {
                    versions.push(record.version);
                }
                Ok(_) => {}
                Err(error) => warn!("Ignoring cache entry {}: {error}", path.display()),
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Delete a cached release.
    ///
    /// # Errors
    /// Fails with [`CacheError::Active`] for the release backing the active
    /// installation, [`CacheError::InUse`] while a pipeline operation holds
    /// the directory, or an IO error if removal fails.
    pub fn erase(&self, repository: &str, version: &str) -> Result<(), CacheError> {
        let location = self.location_for(repository, version);

        if self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&location)
        {
            return Err(CacheError::Active {
                version: version.to_string(),
            });
        }

        // Held across removal so no lease can be taken on a half-deleted
        // directory.
        let leases = self
            .leases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if leases.get(&location).is_some_and(|count| *count > 0) {
            return Err(CacheError::InUse {
                version: version.to_string(),
            });
        }

        remove_path(&location).map_err(|error| CacheError::io(&location, &error))?;
        drop(leases);

        info!("Erased cached release {repository} {version}");
        Ok(())
    }

    /// Mark a cache directory as in use until the returned lease drops.
    #[must_use]
    pub fn lease(&self, location: &Path) -> CacheLease {
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *leases.entry(location.to_path_buf()).or_insert(0) += 1;
        CacheLease {
            location: location.to_path_buf(),
            leases: Arc::clone(&self.leases),
        }
    }

    #[must_use]
    pub fn is_leased(&self, location: &Path) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(location)
            .is_some_and(|count| *count > 0)
    }

    /// Record which cached release backs the active installation of
    /// `repository`; it is protected from [`AssetStore::erase`].
    pub fn set_active(&self, repository: &str, version: &str) {
        let repository_dir = self.repository_dir(repository);
        let location = self.location_for(repository, version);
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        active.retain(|path| path.parent() != Some(repository_dir.as_path()));
        active.insert(location);
    }

    pub(crate) fn load_feed_record(&self, repository: &str) -> FeedRecord {
        let path = self.repository_dir(repository).join(FEED_FILE);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    pub(crate) fn persist_feed_record(
        &self,
        repository: &str,
        record: &FeedRecord,
    ) -> Result<(), CacheError> {
        let dir = self.repository_dir(repository);
        std::fs::create_dir_all(&dir).map_err(|error| CacheError::io(&dir, &error))?;
        let path = dir.join(FEED_FILE);
        let data = serde_json::to_vec_pretty(record).map_err(|error| CacheError::Corrupt {
            path: path.display().to_string(),
            details: error.to_string(),
        })?;
        write_atomic(&path, &data).map_err(|error| CacheError::io(&path, &error))
    }

    /// Remove temp and partial leftovers of interrupted writes below the
    /// repository's cache directory. Must not run while stages are in
    /// flight for that repository.
    pub fn sweep(&self, repository: &str) {
        let dir = self.repository_dir(repository);
        let removed = sweep_dir(&dir, 0);
        if removed > 0 {
            info!("Removed {removed} stale cache leftover(s) under {}", dir.display());
        }
    }
}

const SWEEP_DEPTH: usize = 3;

fn sweep_dir(dir: &Path, depth: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(TEMP_SUFFIX) || name.ends_with(PARTIAL_SUFFIX) {
            match remove_path(&path) {
                Ok(()) => removed += 1,
                Err(error) => warn!("Failed to remove {}: {error}", path.display()),
            }
        } else if depth < SWEEP_DEPTH && entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            removed += sweep_dir(&path, depth + 1);
        }
    }
    removed
}

fn read_marker(marker: &Path) -> Result<Option<ReleaseRecord>, CacheError> {
    let data = match std::fs::read_to_string(marker) {
        Ok(data) => data,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(CacheError::io(marker, &error)),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|error| CacheError::Corrupt {
            path: marker.display().to_string(),
            details: error.to_string(),
        })
}

/// Escape a repository or version into one path component.
///
/// Bytes outside `[A-Za-z0-9.+-]` become `%XX`, so distinct inputs always
/// map to distinct components. `.` and `..` are escaped whole and the empty
/// string becomes `_`, which no escaped input can produce.
fn escape_component(component: &str) -> String {
    use std::fmt::Write as _;

    if component.is_empty() {
        return "_".to_string();
    }
    let escape_all = matches!(component, "." | "..");
    let mut escaped = String::with_capacity(component.len());
    for byte in component.bytes() {
        if !escape_all && (byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'+')) {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::{AssetStore, FeedRecord, ReleaseRecord, escape_component};
    use crate::error::CacheError;
    use crate::release::ReleaseState;

    const REPO: &str = "github.com/acme/tool";

    fn record(version: &str, state: ReleaseState) -> ReleaseRecord {
        ReleaseRecord {
            repository: REPO.to_string(),
            version: version.to_string(),
            prerelease: false,
            state,
            assets: Vec::new(),
            downloaded: BTreeMap::new(),
            extracted: BTreeMap::new(),
            verified: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn locations_are_distinct_per_version_and_contained() {
        let store = AssetStore::new("/cache");
        let a = store.location_for(REPO, "1.0.0");
        let b = store.location_for(REPO, "1.0.1");

        assert_ne!(a, b);
        assert!(a.starts_with(store.repository_dir(REPO)));
        assert_eq!(escape_component("1.0.0+build.1"), "1.0.0+build.1");
        assert_eq!(escape_component(".."), "%2E%2E");
        assert_eq!(escape_component(""), "_");
    }

    #[test]
    fn escaped_components_never_collide() {
        let store = AssetStore::new("/cache");

        assert_ne!(store.repository_dir("a/b"), store.repository_dir("a_b"));
        assert_ne!(
            store.location_for(REPO, "1.0~beta"),
            store.location_for(REPO, "1.0_beta")
        );
        assert_eq!(escape_component("a/b"), "a%2Fb");
        assert_eq!(escape_component("a_b"), "a%5Fb");
        assert_eq!(escape_component("%2F"), "%252F");
        assert_eq!(
            store.repository_dir("github.com/acme/tool"),
            std::path::Path::new("/cache/github.com%2Facme%2Ftool")
        );
    }

    #[test]
    fn persist_then_load_state() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = AssetStore::new(temp_dir.path());

        assert_eq!(
            store.load_state(REPO, "1.0.0").expect("missing marker is not an error"),
            ReleaseState::Empty
        );

        store
            .persist(&record("1.0.0", ReleaseState::Extracted))
            .expect("marker should be written");

        assert_eq!(
            store.load_state(REPO, "1.0.0").expect("marker should load"),
            ReleaseState::Extracted
        );
    }

    #[test]
    fn corrupt_marker_is_reported_and_skipped_in_listing() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = AssetStore::new(temp_dir.path());
        store
            .persist(&record("1.0.0", ReleaseState::Fetched))
            .expect("marker should be written");
        let broken = store.location_for(REPO, "2.0.0");
        std::fs::create_dir_all(&broken).expect("dir should be created");
        std::fs::write(broken.join("release.json"), b"{torn").expect("marker should be written");

        assert!(matches!(
            store.load(REPO, "2.0.0"),
            Err(CacheError::Corrupt { .. })
        ));
        assert_eq!(
            store.list_cached_versions(REPO).expect("listing should succeed"),
            vec!["1.0.0".to_string()]
        );
    }

    #[test]
    fn list_cached_versions_ignores_feed_file_and_unmarked_dirs() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = AssetStore::new(temp_dir.path());
        assert!(
            store
                .list_cached_versions(REPO)
                .expect("missing repository dir is empty")
                .is_empty()
        );

        store
            .persist(&record("1.0.0", ReleaseState::Fetched))
            .expect("marker should be written");
        store
            .persist(&record("1.1.0", ReleaseState::Verified))
            .expect("marker should be written");
        store
            .persist_feed_record(REPO, &FeedRecord { last_check: Some(Utc::now()) })
            .expect("feed record should be written");
        std::fs::create_dir_all(store.repository_dir(REPO).join("scratch"))
            .expect("dir should be created");

        assert_eq!(
            store.list_cached_versions(REPO).expect("listing should succeed"),
            vec!["1.0.0".to_string(), "1.1.0".to_string()]
        );
        assert!(store.load_feed_record(REPO).last_check.is_some());
    }

    #[test]
    fn erase_respects_leases_and_active_release() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = AssetStore::new(temp_dir.path());
        for version in ["1.0.0", "2.0.0"] {
            store
                .persist(&record(version, ReleaseState::Installed))
                .expect("marker should be written");
        }

        let lease = store.lease(&store.location_for(REPO, "1.0.0"));
        assert!(matches!(
            store.erase(REPO, "1.0.0"),
            Err(CacheError::InUse { .. })
        ));
        drop(lease);
        store.erase(REPO, "1.0.0").expect("unleased release should erase");
        assert!(!store.location_for(REPO, "1.0.0").exists());

        store.set_active(REPO, "2.0.0");
        assert!(matches!(
            store.erase(REPO, "2.0.0"),
            Err(CacheError::Active { .. })
        ));
        store.erase(REPO, "3.0.0").expect("missing release erases trivially");
    }

    #[test]
    fn sweep_removes_interrupted_writes() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = AssetStore::new(temp_dir.path());
        store
            .persist(&record("1.0.0", ReleaseState::Fetched))
            .expect("marker should be written");
        let location = store.location_for(REPO, "1.0.0");
        let downloads = location.join("downloads");
        std::fs::create_dir_all(&downloads).expect("dir should be created");
        std::fs::write(downloads.join("app.zip.partial"), b"half").expect("file should be written");
        std::fs::write(location.join(".release.json.1.2.0.tmp"), b"{")
            .expect("file should be written");
        std::fs::write(downloads.join("app.zip"), b"whole").expect("file should be written");

        store.sweep(REPO);

        assert!(!downloads.join("app.zip.partial").exists());
        assert!(!location.join(".release.json.1.2.0.tmp").exists());
        assert!(downloads.join("app.zip").exists());
        assert_eq!(
            store.load_state(REPO, "1.0.0").expect("marker should survive"),
            ReleaseState::Fetched
        );
    }
}
