use serde::Deserialize;
use updraft_backend::HttpClient;

use super::{AssetDescriptor, Candidate};
use crate::error::MetadataError;

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_HOST: &str = "github.com";

/// Lists releases through the GitHub REST API.
///
/// Repositories are identified as `github.com/<owner>/<repo>` (or just
/// `<owner>/<repo>`). Tags may carry a leading `v`, which is stripped before
/// the version is validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubReleaseSource {
    api_base: String,
}

impl Default for GitHubReleaseSource {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

impl GitHubReleaseSource {
    #[must_use]
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub(crate) async fn list(
        &self,
        http: &dyn HttpClient,
        repository: &str,
    ) -> Result<Vec<Candidate>, MetadataError> {
        let (owner, repo) = parse_repository(repository)?;
        let url = format!("{}/repos/{owner}/{repo}/releases", self.api_base);

        let body = http.get(&url).await?;
        let releases: Vec<GitHubRelease> =
            serde_json::from_slice(&body).map_err(|error| MetadataError::Parse {
                url: url.clone(),
                details: error.to_string(),
            })?;

        Ok(releases
            .into_iter()
            .filter(|release| !release.draft)
            .map(candidate_from_release)
            .collect())
    }
}

fn candidate_from_release(release: GitHubRelease) -> Candidate {
    let version = release
        .tag_name
        .strip_prefix('v')
        .unwrap_or(&release.tag_name)
        .to_string();

    Candidate {
        version,
        prerelease: release.prerelease,
        assets: release
            .assets
            .into_iter()
            .map(|asset| AssetDescriptor {
                sha256: asset.digest.as_deref().and_then(parse_sha256_digest),
                url: asset.browser_download_url,
                name: asset.name,
            })
            .collect(),
    }
}

fn parse_repository(repository: &str) -> Result<(&str, &str), MetadataError> {
    let trimmed = repository
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let path = trimmed
        .strip_prefix(GITHUB_HOST)
        .map_or(trimmed, |rest| rest.trim_start_matches('/'));

    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner, repo.trim_end_matches(".git")))
        }
        _ => Err(MetadataError::InvalidRepository(repository.to_string())),
    }
}

fn parse_sha256_digest(digest: &str) -> Option<String> {
    let (algorithm, hash) = digest.split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return None;
    }
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}
