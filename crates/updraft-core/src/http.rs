use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use updraft_backend::{HttpClient, NetworkError};

const USER_AGENT: &str = concat!("updraft/", env!("CARGO_PKG_VERSION"));

/// [`HttpClient`] backed by `reqwest`, streaming downloads straight to disk.
///
/// `timeout` bounds connecting and each idle gap while reading. Metadata
/// requests are additionally capped as a whole; asset downloads are not, so
/// a slow transfer that keeps making progress always completes.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    request_timeout: Option<Duration>,
}

impl ReqwestClient {
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| NetworkError::request_from("client", error))?;
        Ok(Self {
            client,
            request_timeout: Some(timeout),
        })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            request_timeout: None,
        }
    }

    async fn send(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, NetworkError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|error| NetworkError::request_from(url, error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        debug!("GET {url}");
        let response = self.send(url, self.request_timeout).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|error| NetworkError::body_from(url, error))?;
        Ok(bytes.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, NetworkError> {
        let response = self.send(url, None).await?;
        let total = response.content_length().unwrap_or(0);
        let mut downloaded: u64 = 0;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|error| NetworkError::io(dest, &error))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| NetworkError::body_from(url, error))?;
            file.write_all(&chunk)
                .await
                .map_err(|error| NetworkError::io(dest, &error))?;
            downloaded += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|error| NetworkError::io(dest, &error))?;

        info!("Downloaded {url}: {downloaded} of {total} bytes");
        Ok(downloaded)
    }
}
