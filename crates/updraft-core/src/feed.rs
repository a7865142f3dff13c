//! The feed: discovers releases of one repository and drives them through
//! the pipeline according to an install policy.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use updraft_backend::{ArchiveDecoder, HttpClient, InstallTargets, Relauncher, SignatureVerifier};

use crate::error::{CacheError, FeedError, ReleaseError};
use crate::events::{EventSink, FeedEvent, FeedEvents};
use crate::release::{Release, ReleaseContext, ReleaseState};
use crate::single_flight::SingleFlight;
use crate::source::{Candidate, Eligibility, MetadataSource};
use crate::store::{AssetStore, FeedRecord};
use crate::version::VersionScheme;

const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// When a verified release gets installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Releases are discovered but never advanced automatically.
    None,
    /// Install a verified release the next time the feed is activated.
    AtActivation,
    /// Install from [`Feed::prepare_for_quit`].
    AtQuit,
    /// Announce [`FeedEvent::ReadyToInstall`] and install on
    /// [`Feed::install_now`].
    #[default]
    WhenReady,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Repository identifier understood by `source`.
    pub repository: String,
    pub source: MetadataSource,
    pub scheme: VersionScheme,
    pub check_period: Duration,
    pub accept_prereleases: bool,
    /// Require a new unit to be signed by the identity that signed the
    /// unit it replaces. An installed unit without a signature sidecar then
    /// fails every verification.
    pub require_identity_match: bool,
    /// Version of the running installation, if known.
    pub installed_version: Option<String>,
    /// Directory under which every repository and version gets its cache.
    pub cache_base: PathBuf,
}

impl FeedConfig {
    #[must_use]
    pub fn new(repository: impl Into<String>, cache_base: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            source: MetadataSource::default(),
            scheme: VersionScheme::default(),
            check_period: DEFAULT_CHECK_PERIOD,
            accept_prereleases: false,
            require_identity_match: true,
            installed_version: None,
            cache_base: cache_base.into(),
        }
    }
}

/// Host supplied capabilities the pipeline runs on.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpClient>,
    pub archive: Arc<dyn ArchiveDecoder>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub targets: Arc<dyn InstallTargets>,
    pub relauncher: Option<Arc<dyn Relauncher>>,
}

struct FeedShared {
    repository: String,
    scheme: VersionScheme,
    check_period: Duration,
    installed_version: Option<String>,
    context: Arc<ReleaseContext>,
    policy: Mutex<InstallPolicy>,
    current: Mutex<Option<Release>>,
    checks: SingleFlight<Result<Option<Release>, FeedError>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Update feed for one repository. Clones share the same feed.
#[derive(Clone)]
pub struct Feed {
    shared: Arc<FeedShared>,
}

impl Feed {
    /// Create an inactive feed together with the receiving end of its event
    /// channel.
    #[must_use]
    pub fn new(config: FeedConfig, capabilities: Capabilities) -> (Self, FeedEvents) {
        let (events, receiver) = EventSink::channel();
        let store = Arc::new(AssetStore::new(config.cache_base));
        if let Some(installed) = &config.installed_version {
            store.set_active(&config.repository, installed);
        }

        let context = Arc::new(ReleaseContext {
            store,
            capabilities,
            source: config.source,
            eligibility: Eligibility {
                scheme: config.scheme,
                accept_prereleases: config.accept_prereleases,
                installed_version: config.installed_version.clone(),
            },
            require_identity_match: config.require_identity_match,
            events,
        });

        let feed = Self {
            shared: Arc::new(FeedShared {
                repository: config.repository,
                scheme: config.scheme,
                check_period: config.check_period,
                installed_version: config.installed_version,
                context,
                policy: Mutex::new(InstallPolicy::None),
                current: Mutex::new(None),
                checks: SingleFlight::default(),
                scheduler: Mutex::new(None),
            }),
        };
        (feed, receiver)
    }

    #[must_use]
    pub fn repository(&self) -> &str {
        &self.shared.repository
    }

    #[must_use]
    pub fn policy(&self) -> InstallPolicy {
        self.shared.policy()
    }

    #[must_use]
    pub fn current_release(&self) -> Option<Release> {
        self.shared.current()
    }

    #[must_use]
    pub fn store(&self) -> &AssetStore {
        &self.shared.context.store
    }

    /// Start periodic checking under `policy`.
    ///
    /// Resumes the newest cached release newer than the installed version,
    /// installs it right away under [`InstallPolicy::AtActivation`] when it
    /// is already verified, and schedules the first check for when the
    /// check period since the last successful check runs out.
    ///
    /// # Errors
    /// Returns an error only when an at-activation install fails. Periodic
    /// checks are scheduled regardless.
    pub async fn activate(&self, policy: InstallPolicy) -> Result<(), FeedError> {
        let shared = &self.shared;
        *shared
            .policy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = policy;
        shared.context.events.set_delivering(true);
        info!("Activating feed for {} ({policy:?})", shared.repository);

        if shared.current().is_none_or(|release| !release.is_busy()) {
            shared.context.store.sweep(&shared.repository);
        }
        if shared.current().is_none() {
            shared.rehydrate_newest();
        }

        self.start_scheduler();

        if let Some(release) = shared.current() {
            if policy == InstallPolicy::AtActivation && release.state() == ReleaseState::Verified {
                release.install().await?;
            } else if policy != InstallPolicy::None && release.state() < ReleaseState::Verified {
                let shared = Arc::clone(shared);
                tokio::spawn(async move { shared.drive(&release).await });
            }
        }
        Ok(())
    }

    /// Stop scheduled checks and event delivery.
    ///
    /// Work already running is not interrupted; it completes and persists
    /// its result, but no further stage is started for it.
    pub fn deactivate(&self) {
        let shared = &self.shared;
        *shared
            .policy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = InstallPolicy::None;
        shared.context.events.set_delivering(false);
        if let Some(scheduler) = shared
            .scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            scheduler.abort();
        }
        info!("Deactivated feed for {}", shared.repository);
    }

    /// Look for a newer eligible release and make it current.
    ///
    /// Concurrent calls share one check. Unless the policy is
    /// [`InstallPolicy::None`], a new release is driven through download,
    /// extract and verify before this returns. Stage failures are reported
    /// as [`FeedEvent::StageFailed`] and leave the release current for the
    /// next attempt.
    ///
    /// # Errors
    /// Returns an error when the release index cannot be read or the new
    /// release cannot be recorded in the cache.
    pub async fn check(&self) -> Result<Option<Release>, FeedError> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .checks
            .run(move || async move { shared.check().await })
            .await
            .unwrap_or_else(|aborted| Err(FeedError::Aborted(aborted.to_string())))
    }

    /// Erase every cached release whose version is not newer than
    /// `release`'s.
    ///
    /// Every version is attempted; releases held by a running stage or
    /// backing the active installation are reported, not skipped silently.
    ///
    /// # Errors
    /// Returns [`FeedError::Eviction`] listing what was erased and every
    /// version that could not be.
    pub fn clear_this_and_prior_releases(
        &self,
        release: &Release,
    ) -> Result<Vec<String>, FeedError> {
        let shared = &self.shared;
        let Some(limit) = release.version() else {
            return Ok(Vec::new());
        };

        let mut versions: Vec<String> = shared
            .context
            .store
            .list_cached_versions(&shared.repository)?
            .into_iter()
            .filter(|version| {
                matches!(
                    shared.scheme.compare(version, &limit),
                    Some(Ordering::Less | Ordering::Equal)
                )
            })
            .collect();
        versions.sort_by(|a, b| shared.scheme.compare(a, b).unwrap_or(Ordering::Equal));

        let current = shared.current();
        let mut erased = Vec::new();
        let mut failures = BTreeMap::new();
        for version in versions {
            let result = match &current {
                Some(current) if current.version().as_deref() == Some(version.as_str()) => {
                    current.clear().map_err(|error| match error {
                        ReleaseError::Cache(error) => error,
                        other => CacheError::Corrupt {
                            path: current
                                .cache_location()
                                .map(|path| path.display().to_string())
                                .unwrap_or_default(),
                            details: other.to_string(),
                        },
                    })
                }
                _ => shared.context.store.erase(&shared.repository, &version),
            };
            match result {
                Ok(()) => erased.push(version),
                Err(error) => {
                    warn!("Could not evict {} {version}: {error}", shared.repository);
                    failures.insert(version, error);
                }
            }
        }

        if let Some(current) = &current
            && current.state() == ReleaseState::Empty
        {
            shared.set_current(None);
        }

        if failures.is_empty() {
            Ok(erased)
        } else {
            Err(FeedError::Eviction { erased, failures })
        }
    }

    /// Install the current release now.
    ///
    /// # Errors
    /// Fails without a current release or when its install stage fails.
    pub async fn install_now(&self) -> Result<Release, FeedError> {
        let release = self.current_release().ok_or(FeedError::NoCurrentRelease)?;
        release.install().await?;
        Ok(release)
    }

    /// Install a verified release before the host exits, when the policy is
    /// [`InstallPolicy::AtQuit`]. Returns the installed release.
    ///
    /// # Errors
    /// Fails when the install stage fails.
    pub async fn prepare_for_quit(&self) -> Result<Option<Release>, FeedError> {
        if self.policy() != InstallPolicy::AtQuit {
            return Ok(None);
        }
        match self.current_release() {
            Some(release) if release.state() == ReleaseState::Verified => {
                release.install().await?;
                Ok(Some(release))
            }
            _ => Ok(None),
        }
    }

    /// Start the installed release and record it as launched.
    ///
    /// # Errors
    /// Fails when no release is installed, no relaunch capability was
    /// supplied or the new process could not be started.
    pub fn relaunch(&self) -> Result<(), FeedError> {
        let context = &self.shared.context;
        let release = self.current_release().ok_or(FeedError::NoCurrentRelease)?;
        if release.state() < ReleaseState::Installed {
            return Err(FeedError::Relaunch {
                details: format!("release is {}, not installed", release.state()),
            });
        }
        let relauncher = context
            .capabilities
            .relauncher
            .as_ref()
            .ok_or_else(|| FeedError::Relaunch {
                details: "no relaunch capability configured".to_string(),
            })?;
        let targets = context
            .capabilities
            .targets
            .targets()
            .map_err(|error| FeedError::Relaunch {
                details: error.to_string(),
            })?;
        let target = targets.first().ok_or_else(|| FeedError::Relaunch {
            details: "no install targets configured".to_string(),
        })?;

        relauncher
            .relaunch(target)
            .map_err(|error| FeedError::Relaunch {
                details: error.to_string(),
            })?;
        release.mark_launched()?;
        Ok(())
    }

    fn start_scheduler(&self) {
        let delay = self.shared.first_check_delay();
        let period = self.shared.check_period;
        let weak: Weak<FeedShared> = Arc::downgrade(&self.shared);
        debug!("First check for {} in {delay:?}", self.shared.repository);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let feed = Self { shared };
                if let Err(error) = feed.check().await {
                    debug!("Scheduled check failed: {error}");
                }
                drop(feed);
                tokio::time::sleep(period).await;
            }
        });

        if let Some(previous) = self
            .shared
            .scheduler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }
}

impl FeedShared {
    fn policy(&self) -> InstallPolicy {
        *self
            .policy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn current(&self) -> Option<Release> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, release: Option<Release>) {
        *self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = release;
    }

    fn first_check_delay(&self) -> Duration {
        let record = self.context.store.load_feed_record(&self.repository);
        let Some(last_check) = record.last_check else {
            return Duration::ZERO;
        };
        let elapsed = (Utc::now() - last_check).to_std().unwrap_or(Duration::ZERO);
        self.check_period.saturating_sub(elapsed)
    }

    fn record_check(&self) {
        let record = FeedRecord {
            last_check: Some(Utc::now()),
        };
        let store = &self.context.store;
        if let Err(error) = store.persist_feed_record(&self.repository, &record) {
            warn!("Failed to record check time for {}: {error}", self.repository);
        }
    }

    /// Make the newest cached release newer than the installed version
    /// current again.
    fn rehydrate_newest(&self) {
        let versions = match self.context.store.list_cached_versions(&self.repository) {
            Ok(versions) => versions,
            Err(error) => {
                warn!("Failed to list cached releases of {}: {error}", self.repository);
                return;
            }
        };
        let newest = versions
            .into_iter()
            .filter(|version| {
                self.scheme
                    .is_newer(version, self.installed_version.as_deref())
            })
            .max_by(|a, b| self.scheme.compare(a, b).unwrap_or(Ordering::Equal));
        let Some(version) = newest else {
            return;
        };

        match self.context.store.load(&self.repository, &version) {
            Ok(Some(record)) => {
                let release = Release::rehydrate(Arc::clone(&self.context), record);
                info!(
                    "Resuming cached release {} {version} at {}",
                    self.repository,
                    release.state()
                );
                self.set_current(Some(release));
            }
            Ok(None) => {}
            Err(error) => warn!("Failed to load cached release {version}: {error}"),
        }
    }

    async fn check(self: Arc<Self>) -> Result<Option<Release>, FeedError> {
        let context = &self.context;
        let found = context
            .source
            .fetch(
                context.capabilities.http.as_ref(),
                &self.repository,
                &context.eligibility,
            )
            .await;
        let candidate = match found {
            Ok(candidate) => candidate,
            Err(error) => {
                warn!("Checking {} failed: {error}", self.repository);
                context.events.emit(FeedEvent::CheckFailed(error.clone()));
                return Err(error.into());
            }
        };
        self.record_check();

        let current = self.current();
        let baseline = current
            .as_ref()
            .and_then(Release::version)
            .or_else(|| self.installed_version.clone());

        let Some(candidate) = candidate
            .filter(|candidate| self.scheme.is_newer(&candidate.version, baseline.as_deref()))
        else {
            debug!("No release of {} newer than {baseline:?}", self.repository);
            if let Some(release) = &current
                && release.state() < ReleaseState::Verified
            {
                self.drive(release).await;
            }
            return Ok(current);
        };

        let release = self.adopt(candidate)?;
        self.drive(&release).await;
        Ok(Some(release))
    }

    /// Bind `candidate` to its cache entry and make it current.
    fn adopt(&self, candidate: Candidate) -> Result<Release, FeedError> {
        let store = &self.context.store;
        let version = candidate.version.clone();
        let release = match store.load(&self.repository, &version) {
            Ok(Some(record)) => Release::rehydrate(Arc::clone(&self.context), record),
            Ok(None) => {
                Release::from_candidate(&self.repository, Arc::clone(&self.context), candidate)?
            }
            Err(error) => {
                warn!("Discarding unreadable cache entry for {version}: {error}");
                Release::from_candidate(&self.repository, Arc::clone(&self.context), candidate)?
            }
        };

        info!("Found release {} {version}", self.repository);
        self.set_current(Some(release.clone()));
        self.context.events.emit(FeedEvent::StateChanged {
            version,
            state: release.state(),
        });
        Ok(release)
    }

    /// Advance `release` toward `Verified` while the policy allows it.
    async fn drive(&self, release: &Release) {
        for state in [
            ReleaseState::Fetched,
            ReleaseState::Downloaded,
            ReleaseState::Extracted,
        ] {
            if self.policy() == InstallPolicy::None {
                return;
            }
            if release.state() > state {
                continue;
            }
            let result = match state {
                ReleaseState::Fetched => release.download().await,
                ReleaseState::Downloaded => release.extract().await,
                _ => release.verify().await,
            };
            if let Err(error) = result {
                debug!("Pipeline for {} stopped: {error}", self.repository);
                return;
            }
        }

        if release.state() != ReleaseState::Verified {
            return;
        }
        match self.policy() {
            InstallPolicy::WhenReady => {
                if let Some(version) = release.version() {
                    self.context
                        .events
                        .emit(FeedEvent::ReadyToInstall { version });
                }
            }
            InstallPolicy::AtActivation | InstallPolicy::AtQuit => {
                debug!("Install of {} deferred by policy", self.repository);
            }
            InstallPolicy::None => {}
        }
    }
}
