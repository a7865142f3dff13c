use std::collections::BTreeMap;

use thiserror::Error;
use updraft_backend::{ArchiveError, NetworkError, TargetError, VerifyError};

use crate::release::{ReleaseState, Stage, StageReport};

/// Failure to obtain or understand release metadata. Retried on the next
/// scheduled check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("failed to parse release metadata from {url}: {details}")]
    Parse { url: String, details: String },

    #[error("invalid repository identifier: {0}")]
    InvalidRepository(String),

    #[error("no eligible release found for {repository}")]
    NoEligibleRelease { repository: String },

    #[error("upstream release {found} does not match release {expected}")]
    VersionMismatch { expected: String, found: String },
}

/// Why a single asset or install target failed a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("digest mismatch: expected sha256 {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Signature(#[from] VerifyError),

    #[error(transparent)]
    Targets(#[from] TargetError),

    #[error("no extracted artifact named {name}")]
    MissingArtifact { name: String },

    #[error("install {phase} failed for {target}: {details}")]
    Install {
        phase: &'static str,
        target: String,
        details: String,
    },

    #[error("IO error ({kind}) at {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl AssetError {
    pub(crate) fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub(crate) fn install(
        phase: &'static str,
        target: impl Into<String>,
        details: impl std::fmt::Display,
    ) -> Self {
        Self::Install {
            phase,
            target: target.into(),
            details: details.to_string(),
        }
    }
}

/// Failure touching the on-disk release cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("release {version} is in use by an in-flight operation")]
    InUse { version: String },

    #[error("release {version} backs the active installation")]
    Active { version: String },

    #[error("IO error ({kind}) at {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("corrupt state marker at {path}: {details}")]
    Corrupt { path: String, details: String },
}

impl CacheError {
    pub(crate) fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of a failed stage invocation on a release.
///
/// Asset level failures are never raised one by one; the stage variants
/// carry the full report of that invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("{stage} requires the release to be {required}, but it is {actual}")]
    Precondition {
        stage: Stage,
        required: ReleaseState,
        actual: ReleaseState,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("download failed for {} asset(s)", .0.failed.len())]
    Transfer(StageReport),

    #[error("extraction failed for {} asset(s)", .0.failed.len())]
    Extraction(StageReport),

    #[error("verification failed for {} artifact(s)", .0.failed.len())]
    Verification(StageReport),

    #[error("install failed for {} target(s); installation left unchanged", .0.failed.len())]
    Install(StageReport),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{stage} did not complete: {details}")]
    Aborted { stage: Stage, details: String },
}

impl ReleaseError {
    /// The per-asset report attached to a stage failure, if any.
    #[must_use]
    pub fn report(&self) -> Option<&StageReport> {
        match self {
            Self::Transfer(report)
            | Self::Extraction(report)
            | Self::Verification(report)
            | Self::Install(report) => Some(report),
            _ => None,
        }
    }

    /// Security relevant failures must be surfaced to the host as-is.
    #[must_use]
    pub fn is_security_failure(&self) -> bool {
        matches!(self, Self::Verification(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("no current release")]
    NoCurrentRelease,

    #[error("failed to evict {} cached release(s)", failures.len())]
    Eviction {
        erased: Vec<String>,
        failures: BTreeMap<String, CacheError>,
    },

    #[error("relaunch failed: {details}")]
    Relaunch { details: String },

    #[error("feed check did not complete: {0}")]
    Aborted(String),
}
