use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AssetError;

/// Lifecycle position of a release. Ordered: a release only ever moves to a
/// later state, except when its cache is evicted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    #[default]
    Empty,
    Fetched,
    Downloaded,
    Extracted,
    Verified,
    Installed,
    Launched,
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Fetched => "fetched",
            Self::Downloaded => "downloaded",
            Self::Extracted => "extracted",
            Self::Verified => "verified",
            Self::Installed => "installed",
            Self::Launched => "launched",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Download,
    Extract,
    Verify,
    Install,
}

impl Stage {
    /// State a release must have reached before this stage may run.
    #[must_use]
    pub fn requires(self) -> ReleaseState {
        match self {
            Self::Fetch => ReleaseState::Empty,
            Self::Download => ReleaseState::Fetched,
            Self::Extract => ReleaseState::Downloaded,
            Self::Verify => ReleaseState::Extracted,
            Self::Install => ReleaseState::Verified,
        }
    }

    /// State a release advances to once every asset passed this stage.
    #[must_use]
    pub fn completes(self) -> ReleaseState {
        match self {
            Self::Fetch => ReleaseState::Fetched,
            Self::Download => ReleaseState::Downloaded,
            Self::Extract => ReleaseState::Extracted,
            Self::Verify => ReleaseState::Verified,
            Self::Install => ReleaseState::Installed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "fetch",
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Verify => "verify",
            Self::Install => "install",
        };
        f.write_str(name)
    }
}

/// Per-asset outcome of one stage invocation.
///
/// Download and extract key entries by the asset's remote locator; verify and
/// install key them by install target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub succeeded: BTreeMap<String, PathBuf>,
    pub failed: BTreeMap<String, AssetError>,
}

impl StageReport {
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReleaseState, Stage};

    #[test]
    fn states_are_strictly_ordered() {
        let states = [
            ReleaseState::Empty,
            ReleaseState::Fetched,
            ReleaseState::Downloaded,
            ReleaseState::Extracted,
            ReleaseState::Verified,
            ReleaseState::Installed,
            ReleaseState::Launched,
        ];
        assert!(states.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn each_stage_completes_into_the_next_stages_requirement() {
        let stages = [
            Stage::Fetch,
            Stage::Download,
            Stage::Extract,
            Stage::Verify,
            Stage::Install,
        ];
        for pair in stages.windows(2) {
            assert_eq!(pair[0].completes(), pair[1].requires());
        }
        assert_eq!(Stage::Install.completes(), ReleaseState::Installed);
    }

    #[test]
    fn state_marker_uses_snake_case_names() {
        let json =
            serde_json::to_string(&ReleaseState::Downloaded).expect("state should serialize");
        assert_eq!(json, "\"downloaded\"");
    }
}
