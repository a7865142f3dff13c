//! Release metadata sources.
//!
//! A source lists every release a repository publishes; [`select_eligible`]
//! then picks the single candidate the feed should track.

mod github;
mod index;

use std::cmp::Ordering;

use log::debug;
use serde::{Deserialize, Serialize};
use updraft_backend::HttpClient;

use crate::error::MetadataError;
use crate::version::VersionScheme;

pub use github::GitHubReleaseSource;
pub use index::GenericIndexSource;

/// One downloadable unit of a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A release as published by the index, before a cache entry exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: String,
    pub prerelease: bool,
    pub assets: Vec<AssetDescriptor>,
}

/// Rules for picking the release to track among everything published.
#[derive(Debug, Clone, Default)]
pub struct Eligibility {
    pub scheme: VersionScheme,
    pub accept_prereleases: bool,
    pub installed_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSource {
    GitHub(GitHubReleaseSource),
    Index(GenericIndexSource),
}

impl MetadataSource {
    /// Fetch the newest eligible release for `repository`.
    ///
    /// An index without any eligible release yields `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error when the index cannot be retrieved or parsed.
    pub async fn fetch(
        &self,
        http: &dyn HttpClient,
        repository: &str,
        eligibility: &Eligibility,
    ) -> Result<Option<Candidate>, MetadataError> {
        let candidates = match self {
            Self::GitHub(source) => source.list(http, repository).await?,
            Self::Index(source) => source.list(http).await?,
        };
        debug!(
            "Release index for {repository} lists {} release(s)",
            candidates.len()
        );
        Ok(select_eligible(candidates, eligibility))
    }
}

impl Default for MetadataSource {
    fn default() -> Self {
        Self::GitHub(GitHubReleaseSource::default())
    }
}

/// Pick the greatest valid version among `candidates`.
///
/// Prereleases are only skipped when prereleases are not accepted *and* a
/// stable release newer than the installed version exists.
#[must_use]
pub fn select_eligible(candidates: Vec<Candidate>, eligibility: &Eligibility) -> Option<Candidate> {
    let scheme = eligibility.scheme;
    let valid: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| {
            let ok = scheme.validate(&candidate.version);
            if !ok {
                debug!("Ignoring release with invalid version {}", candidate.version);
            }
            ok
        })
        .collect();

    if eligibility.accept_prereleases {
        return newest(scheme, valid.iter());
    }

    let newest_stable = newest(scheme, valid.iter().filter(|candidate| !candidate.prerelease));
    match newest_stable {
        Some(stable)
            if scheme.is_newer(&stable.version, eligibility.installed_version.as_deref()) =>
        {
            Some(stable)
        }
        _ => newest(scheme, valid.iter()),
    }
}

fn newest<'a>(
    scheme: VersionScheme,
    candidates: impl Iterator<Item = &'a Candidate>,
) -> Option<Candidate> {
    candidates
        .max_by(|a, b| {
            scheme
                .compare(&a.version, &b.version)
                .unwrap_or(Ordering::Equal)
        })
        .cloned()
}

/// Derive a safe local file name from a download URL.
pub(crate) fn file_name_from_url(url: &str) -> Option<String> {
    let raw = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()?;
    std::path::Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && !n.contains(".."))
        .map(ToString::to_string)
}
