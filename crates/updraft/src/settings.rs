use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use updraft_core::{GenericIndexSource, InstallPolicy, MetadataSource, VersionScheme};
use updraft_platform::AppPaths;

/// Where release metadata comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSetting {
    #[default]
    Github,
    Index {
        url: String,
    },
}

impl SourceSetting {
    #[must_use]
    pub fn to_metadata_source(&self) -> MetadataSource {
        match self {
            Self::Github => MetadataSource::default(),
            Self::Index { url } => MetadataSource::Index(GenericIndexSource::new(url.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    /// `github.com/<owner>/<repo>` for GitHub, any label for an index.
    #[serde(default)]
    pub repository: String,

    #[serde(default)]
    pub source: SourceSetting,

    #[serde(default)]
    pub version_scheme: VersionScheme,

    #[serde(default = "default_check_period")]
    pub check_period_secs: u64,

    #[serde(default)]
    pub install_policy: InstallPolicy,

    #[serde(default)]
    pub accept_prereleases: bool,

    /// Only accept units signed by the key that signed the installed unit.
    ///
    /// The shipped executable (or bundle) must then carry its own
    /// `<name>.sig` sidecar; without it every update fails verification
    /// with a missing signature.
    #[serde(default = "default_true")]
    pub require_identity_match: bool,

    /// Hex encoded Ed25519 public keys allowed to sign releases.
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Replaces the running executable as the install target when set.
    #[serde(default)]
    pub install_targets: Vec<PathBuf>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_check_period() -> u64 {
    24 * 60 * 60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            repository: String::new(),
            source: SourceSetting::default(),
            version_scheme: VersionScheme::default(),
            check_period_secs: default_check_period(),
            install_policy: InstallPolicy::default(),
            accept_prereleases: false,
            require_identity_match: true,
            trusted_keys: Vec::new(),
            cache_dir: None,
            install_targets: Vec::new(),
            http_timeout_secs: default_http_timeout(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl FeedSettings {
    /// Settings from the platform config directory, or defaults when the
    /// file is missing or unreadable.
    #[must_use]
    pub fn load() -> Self {
        match AppPaths::new() {
            Ok(paths) => Self::load_from(&paths.settings_file()),
            Err(_) => Self::default(),
        }
    }

    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring invalid settings at {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Write the settings to the platform config directory.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let paths = AppPaths::new().map_err(std::io::Error::other)?;
        paths.ensure_dirs()?;
        self.save_to(&paths.settings_file())
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    #[must_use]
    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use updraft_core::{InstallPolicy, MetadataSource, VersionScheme};

    use super::{FeedSettings, SourceSetting};

    #[test]
    fn defaults_match_expected_values() {
        let settings = FeedSettings::default();

        assert_eq!(settings.check_period_secs, 86_400);
        assert_eq!(settings.install_policy, InstallPolicy::WhenReady);
        assert_eq!(settings.version_scheme, VersionScheme::Semver);
        assert!(settings.require_identity_match);
        assert!(!settings.accept_prereleases);
        assert_eq!(settings.http_timeout_secs, 30);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let value = json!({
            "repository": "github.com/acme/tool",
            "install_policy": "at_quit",
            "source": { "index": { "url": "https://updates.example.com/index.json" } }
        });

        let settings: FeedSettings =
            serde_json::from_value(value).expect("settings JSON should deserialize");

        assert_eq!(settings.repository, "github.com/acme/tool");
        assert_eq!(settings.install_policy, InstallPolicy::AtQuit);
        assert!(settings.require_identity_match);
        assert_eq!(settings.check_period_secs, 86_400);
        let MetadataSource::Index(source) = settings.source.to_metadata_source() else {
            panic!("an index source should be configured");
        };
        assert_eq!(source.url(), "https://updates.example.com/index.json");
    }

    #[test]
    fn github_source_is_a_plain_string() {
        let value = serde_json::to_value(SourceSetting::Github).expect("source should serialize");
        assert_eq!(value, json!("github"));
    }

    #[test]
    fn load_from_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("settings.json");

        assert_eq!(FeedSettings::load_from(&path).repository, "");

        std::fs::write(&path, "{ not json").expect("settings file should be written");
        assert_eq!(FeedSettings::load_from(&path).check_period_secs, 86_400);
    }

    #[test]
    fn save_to_then_load_from_keeps_values() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("settings.json");
        let settings = FeedSettings {
            repository: "acme/tool".to_string(),
            trusted_keys: vec!["ab".repeat(32)],
            version_scheme: VersionScheme::Dotted,
            ..FeedSettings::default()
        };

        settings.save_to(&path).expect("settings should save");
        let loaded = FeedSettings::load_from(&path);

        assert_eq!(loaded.repository, "acme/tool");
        assert_eq!(loaded.trusted_keys, settings.trusted_keys);
        assert_eq!(loaded.version_scheme, VersionScheme::Dotted);
    }
}
