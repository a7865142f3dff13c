use updraft_core::InvalidKey;
use updraft_core::backend::{NetworkError, TargetError};
use updraft_platform::AppPathsError;

/// Underlying cause of a [`SetupError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupErrorDetail {
    Message(String),
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    Network(NetworkError),
    Key(InvalidKey),
    Targets(TargetError),
    Paths(AppPathsError),
}

impl std::fmt::Display for SetupErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            Self::Io { kind, message } => write!(f, "{kind}: {message}"),
            Self::Network(error) => write!(f, "{error}"),
            Self::Key(error) => write!(f, "{error}"),
            Self::Targets(error) => write!(f, "{error}"),
            Self::Paths(error) => write!(f, "{error}"),
        }
    }
}

impl From<&str> for SetupErrorDetail {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<String> for SetupErrorDetail {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<std::io::Error> for SetupErrorDetail {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<NetworkError> for SetupErrorDetail {
    fn from(value: NetworkError) -> Self {
        Self::Network(value)
    }
}

impl From<InvalidKey> for SetupErrorDetail {
    fn from(value: InvalidKey) -> Self {
        Self::Key(value)
    }
}

impl From<TargetError> for SetupErrorDetail {
    fn from(value: TargetError) -> Self {
        Self::Targets(value)
    }
}

impl From<AppPathsError> for SetupErrorDetail {
    fn from(value: AppPathsError) -> Self {
        Self::Paths(value)
    }
}

/// Why a feed could not be assembled from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    MissingRepository,
    NoTrustedKeys,
    InvalidSetting {
        setting: &'static str,
        details: SetupErrorDetail,
    },
    CapabilityUnavailable {
        capability: &'static str,
        details: SetupErrorDetail,
    },
}

impl SetupError {
    pub fn invalid_setting(setting: &'static str, details: impl Into<SetupErrorDetail>) -> Self {
        Self::InvalidSetting {
            setting,
            details: details.into(),
        }
    }

    pub fn capability_unavailable(
        capability: &'static str,
        details: impl Into<SetupErrorDetail>,
    ) -> Self {
        Self::CapabilityUnavailable {
            capability,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRepository => write!(f, "No repository configured"),
            Self::NoTrustedKeys => write!(f, "No trusted signing keys configured"),
            Self::InvalidSetting { setting, details } => {
                write!(f, "Invalid {setting} setting: {details}")
            }
            Self::CapabilityUnavailable {
                capability,
                details,
            } => write!(f, "{capability} unavailable: {details}"),
        }
    }
}

impl std::error::Error for SetupError {}

#[cfg(test)]
mod tests {
    use updraft_core::backend::NetworkError;

    use super::{SetupError, SetupErrorDetail};

    #[test]
    fn constructors_include_context() {
        let invalid = SetupError::invalid_setting("trusted_keys", "expected 32 bytes");
        let network = SetupError::capability_unavailable(
            "Network client",
            NetworkError::request("https://api.github.com", "no TLS backend"),
        );

        assert_eq!(
            invalid,
            SetupError::InvalidSetting {
                setting: "trusted_keys",
                details: SetupErrorDetail::from("expected 32 bytes"),
            }
        );
        assert_eq!(
            invalid.to_string(),
            "Invalid trusted_keys setting: expected 32 bytes"
        );
        assert!(network.to_string().starts_with("Network client unavailable: "));
        assert_eq!(
            SetupError::MissingRepository.to_string(),
            "No repository configured"
        );
    }

    #[test]
    fn io_detail_keeps_error_kind_and_message() {
        let detail = SetupErrorDetail::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(matches!(
            detail,
            SetupErrorDetail::Io {
                kind: std::io::ErrorKind::PermissionDenied,
                ..
            }
        ));
        assert_eq!(detail.to_string(), "permission denied: denied");
    }
}
