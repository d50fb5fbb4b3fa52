//! Local-file transport.
//!
//! Accepts plain paths and `file://` URLs, which lets a client sync against
//! a directory of published packages.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::{ByteStream, FetchError, Fetcher};

const CHUNK_SIZE: usize = 64 * 1024;

/// Reads resources from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    chunk_size: usize,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Use a custom chunk size for streamed reads
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Whether a URL is handled by this transport
    pub fn handles(url: &str) -> bool {
        url.starts_with("file://") || !url.contains("://")
    }

    fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }

    fn map_err(url: &str, e: std::io::Error) -> FetchError {
        if e.kind() == std::io::ErrorKind::NotFound {
            FetchError::NotFound(url.to_string())
        } else {
            FetchError::Io {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }
}

struct FileStream {
    url: String,
    file: File,
    len: Option<u64>,
    chunk_size: usize,
}

#[async_trait]
impl ByteStream for FileStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| FileFetcher::map_err(&self.url, e))?;

        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    fn total_len(&self) -> Option<u64> {
        self.len
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        tokio::fs::read(Self::path_of(url))
            .await
            .map_err(|e| Self::map_err(url, e))
    }

    async fn fetch_stream(&self, url: &str) -> Result<Box<dyn ByteStream>, FetchError> {
        let file = File::open(Self::path_of(url))
            .await
            .map_err(|e| Self::map_err(url, e))?;
        let len = file.metadata().await.ok().map(|m| m.len());

        Ok(Box::new(FileStream {
            url: url.to_string(),
            file,
            len,
            chunk_size: if self.chunk_size == 0 {
                CHUNK_SIZE
            } else {
                self.chunk_size
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_plain_path_and_file_url() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        tokio::fs::write(&path, b"{}").await.unwrap();

        let fetcher = FileFetcher::new();
        let plain = path.to_string_lossy().to_string();
        assert_eq!(fetcher.fetch(&plain).await.unwrap(), b"{}");
        assert_eq!(
            fetcher.fetch(&format!("file://{}", plain)).await.unwrap(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let fetcher = FileFetcher::new();
        assert!(matches!(
            fetcher.fetch("/definitely/not/here.json").await,
            Err(FetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_in_chunks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("package.hblib");
        tokio::fs::write(&path, vec![7u8; 10]).await.unwrap();

        let fetcher = FileFetcher::with_chunk_size(4);
        let mut stream = fetcher
            .fetch_stream(&path.to_string_lossy())
            .await
            .unwrap();
        assert_eq!(stream.total_len(), Some(10));

        let mut sizes = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_handles() {
        assert!(FileFetcher::handles("/srv/hblib/manifest.json"));
        assert!(FileFetcher::handles("file:///srv/manifest.json"));
        assert!(!FileFetcher::handles("https://example.org/manifest.json"));
    }
}
