//! HTTP transport.

use std::time::Duration;

use async_trait::async_trait;

use super::{ByteStream, FetchError, Fetcher};

/// HTTP client for manifests, packages and images
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a per-request timeout
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hblib/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }
}

/// Body of a response, read chunk by chunk
struct ResponseStream {
    url: String,
    response: reqwest::Response,
}

#[async_trait]
impl ByteStream for ResponseStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| FetchError::Network {
                url: self.url.clone(),
                message: e.to_string(),
            })
    }

    fn total_len(&self) -> Option<u64> {
        self.response.content_length()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url).await?;
        let bytes = response.bytes().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn fetch_stream(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        let response = self.get(url).await?;
        Ok(Box::new(ResponseStream {
            url: url.to_string(),
            response,
        }))
    }
}
