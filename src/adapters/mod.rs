//! Adapter interfaces for external systems.
//!
//! - [`Fetcher`]: the transport capability (`fetch(url) -> bytes`), with an
//!   HTTP implementation and a local-file implementation
//! - [`ExtractorAdapter`]: the external PDF extraction tool

pub mod extractor;
pub mod file;
pub mod http;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Session;

pub use extractor::ExtractorAdapter;
pub use file::FileFetcher;
pub use http::HttpFetcher;

/// Errors from a fetch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error reading {url}: {message}")]
    Io { url: String, message: String },
}

/// An incremental byte source
#[async_trait]
pub trait ByteStream: Send {
    /// Next chunk, or `None` at the end
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;

    /// Total length if the source knows it
    fn total_len(&self) -> Option<u64> {
        None
    }
}

/// A stream over bytes already in memory, yielded as one chunk
pub struct SingleChunk(Option<Vec<u8>>);

impl SingleChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Some(bytes))
    }
}

#[async_trait]
impl ByteStream for SingleChunk {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.0.take())
    }

    fn total_len(&self) -> Option<u64> {
        self.0.as_ref().map(|b| b.len() as u64)
    }
}

/// Trait for transports
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Fetch a whole resource
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Fetch a resource incrementally.
    ///
    /// The default buffers the whole resource; transports that can stream
    /// override it.
    async fn fetch_stream(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        let bytes = self.fetch(url).await?;
        Ok(Box::new(SingleChunk::new(bytes)))
    }
}

/// Trait for PDF-to-session extraction
#[async_trait]
pub trait SessionExtractor: Send + Sync {
    /// Extract one session record from a PDF
    async fn extract(&self, pdf: &Path) -> anyhow::Result<Session>;
}

/// Dispatches each URL to the file or HTTP transport by its scheme
pub struct SchemeFetcher {
    file: FileFetcher,
    http: HttpFetcher,
}

impl SchemeFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            file: FileFetcher::new(),
            http,
        }
    }

    fn pick(&self, url: &str) -> &dyn Fetcher {
        if FileFetcher::handles(url) {
            &self.file
        } else {
            &self.http
        }
    }
}

#[async_trait]
impl Fetcher for SchemeFetcher {
    fn name(&self) -> &str {
        "scheme"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.pick(url).fetch(url).await
    }

    async fn fetch_stream(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        self.pick(url).fetch_stream(url).await
    }
}
