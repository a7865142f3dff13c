use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Network error for {url} ({stage}): {details}")]
    Transport {
        url: String,
        stage: NetworkStage,
        details: String,
    },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("IO error ({kind}) writing {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    #[error("request")]
    Request,
    #[error("response body")]
    Body,
}

impl NetworkError {
    pub fn request(url: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            stage: NetworkStage::Request,
            details: details.into(),
        }
    }

    pub fn request_from<E>(url: impl Into<String>, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::request(url, error.to_string())
    }

    pub fn body(url: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            stage: NetworkStage::Body,
            details: details.into(),
        }
    }

    pub fn body_from<E>(url: impl Into<String>, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::body(url, error.to_string())
    }

    pub fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("IO error ({kind}) at {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Malformed archive {path}: {details}")]
    Malformed { path: String, details: String },
}

impl ArchiveError {
    pub fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("No signature found for {path}")]
    MissingSignature { path: String },

    #[error("Invalid signature for {path}: {details}")]
    InvalidSignature { path: String, details: String },

    #[error("Signature for {path} is not from a trusted key")]
    UntrustedSigner { path: String },

    #[error("Signer identity {actual} does not match installed identity {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("IO error ({kind}) at {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl VerifyError {
    pub fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("Could not determine install target: {details}")]
    Unavailable { details: String },
}

#[cfg(test)]
mod tests {
    use super::{NetworkError, NetworkStage, VerifyError};

    #[test]
    fn network_helpers_set_expected_stage() {
        let request = NetworkError::request("https://example.com/a.zip", "timed out");
        assert!(matches!(
            request,
            NetworkError::Transport {
                stage: NetworkStage::Request,
                ..
            }
        ));

        let body = NetworkError::body_from("https://example.com/a.zip", "connection reset");
        assert!(matches!(
            body,
            NetworkError::Transport {
                stage: NetworkStage::Body,
                ref details,
                ..
            } if details == "connection reset"
        ));
    }

    #[test]
    fn io_conversion_keeps_kind_and_path() {
        let error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let mapped = NetworkError::io(std::path::Path::new("/tmp/asset.zip"), &error);
        assert!(matches!(
            mapped,
            NetworkError::Io { kind, ref path, .. }
                if kind == std::io::ErrorKind::PermissionDenied && path == "/tmp/asset.zip"
        ));
    }

    #[test]
    fn identity_mismatch_display_names_both_identities() {
        let error = VerifyError::IdentityMismatch {
            expected: "aaaa".to_string(),
            actual: "bbbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Signer identity bbbb does not match installed identity aaaa"
        );
    }
}
