use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use updraft_core::backend::{HttpClient, InstallTarget, InstallTargets};
use updraft_core::{
    Capabilities, Ed25519Verifier, Feed, FeedConfig, FeedEvents, ReqwestClient, StaticTargets,
    ZipDecoder,
};
use updraft_platform::{AppPaths, CurrentInstall};

use crate::error::SetupError;
use crate::settings::FeedSettings;

/// Assembles a [`Feed`] with the default capabilities from settings.
pub struct FeedBuilder {
    settings: FeedSettings,
    installed_version: Option<String>,
    cache_base: Option<PathBuf>,
    http: Option<Arc<dyn HttpClient>>,
}

impl FeedBuilder {
    #[must_use]
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            settings,
            installed_version: None,
            cache_base: None,
            http: None,
        }
    }

    /// Version of the running installation, usually
    /// `env!("CARGO_PKG_VERSION")` of the host.
    #[must_use]
    pub fn installed_version(mut self, version: impl Into<String>) -> Self {
        self.installed_version = Some(version.into());
        self
    }

    /// Overrides both the `cache_dir` setting and the platform default.
    #[must_use]
    pub fn cache_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_base = Some(path.into());
        self
    }

    /// Use `http` instead of a reqwest client built from the timeout setting.
    #[must_use]
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// # Errors
    /// Fails without a repository or when no cache directory can be found.
    pub fn config(&self) -> Result<FeedConfig, SetupError> {
        let settings = &self.settings;
        if settings.repository.trim().is_empty() {
            return Err(SetupError::MissingRepository);
        }

        let cache_base = match self.cache_base.clone().or_else(|| settings.cache_dir.clone()) {
            Some(path) => path,
            None => AppPaths::new()
                .map_err(|error| SetupError::capability_unavailable("Cache directory", error))?
                .release_cache_dir(),
        };

        let mut config = FeedConfig::new(settings.repository.trim(), cache_base);
        config.source = settings.source.to_metadata_source();
        config.scheme = settings.version_scheme;
        config.check_period = settings.check_period();
        config.accept_prereleases = settings.accept_prereleases;
        config.require_identity_match = settings.require_identity_match;
        config.installed_version.clone_from(&self.installed_version);
        Ok(config)
    }

    /// # Errors
    /// Fails when no trusted key is configured, a key or install target is
    /// malformed, or the network client cannot be created.
    pub fn capabilities(&self) -> Result<Capabilities, SetupError> {
        let settings = &self.settings;
        if settings.trusted_keys.is_empty() {
            return Err(SetupError::NoTrustedKeys);
        }
        let verifier = Ed25519Verifier::from_hex_keys(&settings.trusted_keys)
            .map_err(|error| SetupError::invalid_setting("trusted_keys", error))?;

        let http: Arc<dyn HttpClient> = match &self.http {
            Some(http) => Arc::clone(http),
            None => Arc::new(
                ReqwestClient::new(settings.http_timeout())
                    .map_err(|error| SetupError::capability_unavailable("Network client", error))?,
            ),
        };

        let targets: Arc<dyn InstallTargets> = if settings.install_targets.is_empty() {
            Arc::new(CurrentInstall)
        } else {
            let targets = settings
                .install_targets
                .iter()
                .map(|path| {
                    InstallTarget::from_path(path).ok_or_else(|| {
                        SetupError::invalid_setting(
                            "install_targets",
                            format!("{} has no file name", path.display()),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(StaticTargets(targets))
        };

        Ok(Capabilities {
            http,
            archive: Arc::new(ZipDecoder),
            verifier: Arc::new(verifier),
            targets,
            relauncher: Some(Arc::new(CurrentInstall)),
        })
    }

    /// # Errors
    /// See [`FeedBuilder::config`] and [`FeedBuilder::capabilities`].
    pub fn build(self) -> Result<(Feed, FeedEvents), SetupError> {
        let config = self.config()?;
        let capabilities = self.capabilities()?;
        debug!(
            "Building feed for {} with cache at {}",
            config.repository,
            config.cache_base.display()
        );
        Ok(Feed::new(config, capabilities))
    }
}
