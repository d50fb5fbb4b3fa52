//! Package download into the staging area.

use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::cancel::CancelToken;
use super::state::SyncError;
use crate::adapters::Fetcher;
use crate::domain::{PackageRef, PackageType};

/// A downloaded, not yet verified package
pub(crate) enum StagedPackage {
    /// Manifest-form package, small enough to hold in memory
    Json { bytes: Vec<u8> },

    /// Archive streamed to a staging file, removed when dropped
    Archive { file: NamedTempFile, size: u64 },
}

impl StagedPackage {
    pub(crate) fn size(&self) -> u64 {
        match self {
            StagedPackage::Json { bytes } => bytes.len() as u64,
            StagedPackage::Archive { size, .. } => *size,
        }
    }
}

fn check_sha256(expected: Option<&str>, actual: &[u8]) -> Result<(), SyncError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let actual = hex::encode(actual);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(SyncError::PackageCorrupt(format!(
            "checksum mismatch: manifest declares {}, package is {}",
            expected, actual
        )))
    }
}

/// Download `package`, reporting `(received, total)` as bytes arrive.
///
/// Archives are written chunk by chunk into `staging_dir` and hashed on the
/// way, so memory use does not grow with the package size.
pub(crate) async fn download(
    fetcher: &dyn Fetcher,
    package: &PackageRef,
    staging_dir: &Path,
    cancel: &CancelToken,
    progress: impl Fn(u64, Option<u64>),
) -> Result<StagedPackage, SyncError> {
    let unavailable = |e: crate::adapters::FetchError| SyncError::PackageUnavailable(e.to_string());

    match package.kind {
        PackageType::Json => {
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                fetched = fetcher.fetch(&package.url) => fetched.map_err(unavailable)?,
            };
            progress(bytes.len() as u64, Some(bytes.len() as u64));
            check_sha256(package.sha256.as_deref(), &Sha256::digest(&bytes))?;

            debug!(bytes = bytes.len(), "Downloaded manifest-form package");
            Ok(StagedPackage::Json { bytes })
        }
        PackageType::Zip => {
            tokio::fs::create_dir_all(staging_dir)
                .await
                .map_err(|e| SyncError::storage("Failed to create staging directory", e))?;

            let staged = tempfile::Builder::new()
                .prefix("package-")
                .suffix(".hblib.part")
                .tempfile_in(staging_dir)
                .map_err(|e| SyncError::storage("Failed to create staging file", e))?;
            let handle = staged
                .as_file()
                .try_clone()
                .map_err(|e| SyncError::storage("Failed to open staging file", e))?;
            let mut out = tokio::fs::File::from_std(handle);

            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                stream = fetcher.fetch_stream(&package.url) => stream.map_err(unavailable)?,
            };
            let total = stream.total_len();

            let mut hasher = Sha256::new();
            let mut received = 0u64;
            progress(0, total);

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    chunk = stream.next_chunk() => chunk.map_err(unavailable)?,
                };
                let Some(chunk) = chunk else { break };

                hasher.update(&chunk);
                out.write_all(&chunk)
                    .await
                    .map_err(|e| SyncError::storage("Failed to write staging file", e))?;
                received += chunk.len() as u64;
                progress(received, total);
            }

            out.flush()
                .await
                .map_err(|e| SyncError::storage("Failed to flush staging file", e))?;
            out.sync_all()
                .await
                .map_err(|e| SyncError::storage("Failed to sync staging file", e))?;

            if let Some(total) = total {
                if total != received {
                    return Err(SyncError::PackageUnavailable(format!(
                        "download ended after {} of {} bytes",
                        received, total
                    )));
                }
            }
            check_sha256(package.sha256.as_deref(), &hasher.finalize())?;

            info!(bytes = received, path = %staged.path().display(), "Archive staged");
            Ok(StagedPackage::Archive {
                file: staged,
                size: received,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FileFetcher;
    use crate::library::package_sha256;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn package(url: String, kind: PackageType, sha256: Option<String>) -> PackageRef {
        PackageRef { url, kind, sha256 }
    }

    #[tokio::test]
    async fn test_archive_is_streamed_to_staging() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("library_v15.hblib");
        let body = vec![42u8; 1000];
        tokio::fs::write(&source, &body).await.unwrap();

        let staging = temp.path().join("staging");
        let seen = Mutex::new(Vec::new());
        let staged = download(
            &FileFetcher::with_chunk_size(256),
            &package(
                source.to_string_lossy().to_string(),
                PackageType::Zip,
                Some(package_sha256(&body)),
            ),
            &staging,
            &CancelToken::new(),
            |received, _| seen.lock().unwrap().push(received),
        )
        .await
        .unwrap();

        assert_eq!(staged.size(), 1000);
        assert_eq!(seen.lock().unwrap().last(), Some(&1000));
        match staged {
            StagedPackage::Archive { file, .. } => {
                assert!(file.path().starts_with(&staging));
                assert_eq!(std::fs::read(file.path()).unwrap(), body);
            }
            StagedPackage::Json { .. } => panic!("expected archive"),
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("library.json");
        tokio::fs::write(&source, b"{}").await.unwrap();

        let result = download(
            &FileFetcher::new(),
            &package(
                source.to_string_lossy().to_string(),
                PackageType::Json,
                Some("00".repeat(32)),
            ),
            temp.path(),
            &CancelToken::new(),
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(SyncError::PackageCorrupt(_))));
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_staging_file() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("library.hblib");
        tokio::fs::write(&source, vec![0u8; 64]).await.unwrap();
        let staging = temp.path().join("staging");

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = download(
            &FileFetcher::new(),
            &package(source.to_string_lossy().to_string(), PackageType::Zip, None),
            &staging,
            &cancel,
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_package_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let result = download(
            &FileFetcher::new(),
            &package(
                temp.path().join("gone.json").to_string_lossy().to_string(),
                PackageType::Json,
                None,
            ),
            temp.path(),
            &CancelToken::new(),
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(SyncError::PackageUnavailable(_))));
    }
}
