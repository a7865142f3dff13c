use serde::Deserialize;
use updraft_backend::HttpClient;

use super::{AssetDescriptor, Candidate, file_name_from_url};
use crate::error::MetadataError;

const SNIPPET_CHARS: usize = 120;

/// Reads a static JSON release index:
///
/// ```json
/// {"releases": [{"version": "1.2.0", "prerelease": false,
///   "assets": [{"url": "https://…/app.zip", "sha256": "…"}]}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericIndexSource {
    url: String,
}

#[derive(Deserialize)]
struct IndexDocument {
    #[serde(default)]
    releases: Vec<IndexRelease>,
}

#[derive(Deserialize)]
struct IndexRelease {
    version: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<IndexAsset>,
}

#[derive(Deserialize)]
struct IndexAsset {
    url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

impl GenericIndexSource {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) async fn list(
        &self,
        http: &dyn HttpClient,
    ) -> Result<Vec<Candidate>, MetadataError> {
        let body = http.get(&self.url).await?;
        let document: IndexDocument =
            serde_json::from_slice(&body).map_err(|error| MetadataError::Parse {
                url: self.url.clone(),
                details: format!(
                    "{error}{}",
                    response_snippet(&String::from_utf8_lossy(&body), SNIPPET_CHARS)
                ),
            })?;

        Ok(document
            .releases
            .into_iter()
            .map(|release| Candidate {
                version: release.version,
                prerelease: release.prerelease,
                assets: release
                    .assets
                    .into_iter()
                    .filter_map(|asset| {
                        let name = asset.name.or_else(|| file_name_from_url(&asset.url))?;
                        Some(AssetDescriptor {
                            url: asset.url,
                            name,
                            sha256: asset.sha256.map(|hash| hash.to_ascii_lowercase()),
                        })
                    })
                    .collect(),
            })
            .collect())
    }
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHttp;

    const INDEX: &str = "https://updates.example.com/index.json";

    #[tokio::test]
    async fn list_reads_releases_and_derives_asset_names() {
        let http = FakeHttp::new();
        http.respond(
            INDEX,
            br#"{"releases": [
                {"version": "1.1.0", "assets": [
                    {"url": "https://updates.example.com/1.1.0/app.zip?sig=1", "sha256": "ABCD"},
                    {"url": "https://updates.example.com/1.1.0/raw", "name": "tool"}
                ]},
                {"version": "1.2.0-beta.1", "prerelease": true}
            ]}"#,
        );

        let candidates = GenericIndexSource::new(INDEX)
            .list(&http)
            .await
            .expect("index should parse");

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].assets[0].name, "app.zip");
        assert_eq!(candidates[0].assets[0].sha256.as_deref(), Some("abcd"));
        assert_eq!(candidates[0].assets[1].name, "tool");
        assert!(candidates[1].prerelease);
        assert!(candidates[1].assets.is_empty());
    }

    #[tokio::test]
    async fn list_includes_body_snippet_in_parse_errors() {
        let http = FakeHttp::new();
        http.respond(INDEX, b"<html>gateway timeout</html>");

        let error = GenericIndexSource::new(INDEX)
            .list(&http)
            .await
            .expect_err("html should not parse");

        assert!(matches!(
            error,
            MetadataError::Parse { ref details, .. } if details.contains("gateway timeout")
        ));
    }

    #[test]
    fn response_snippet_is_empty_for_empty_body() {
        assert_eq!(response_snippet("", 10), "");
        assert_eq!(response_snippet("abcdef", 3), ": abc");
    }
}
