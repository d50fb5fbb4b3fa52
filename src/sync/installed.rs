//! The installed library: on-disk layout and in-memory handle.
//!
//! ```text
//! installed/
//!   state.json                   commit point, replaced atomically
//!   library-<version>-<id>.json  snapshot of the installed version
//!   images-<version>-<id>/       extracted archive images (archive installs)
//!   install.lock                 held while an install is running
//! ```
//!
//! A version's files are written under fresh names first. Only the rename of
//! `state.json` makes them current, so an interrupted install leaves the
//! previous library intact.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::SyncError;
use super::verify::VerifiedPackage;
use crate::domain::{LibraryStats, LibrarySnapshot, LibraryVersion, PackageType};
use crate::library::resolver::ResolveContext;

pub const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "install.lock";

/// Contents of `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledState {
    pub version: String,
    pub package_type: PackageType,
    pub installed_at: DateTime<Utc>,
    /// Snapshot file name, relative to the installed directory
    pub library_file: String,
    /// Image directory name for archive installs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<String>,
    pub stats: LibraryStats,
}

/// A fully loaded installed version.
///
/// Once a newer version is installed this one is marked superseded, and its
/// files are removed when the last holder drops it.
#[derive(Debug)]
pub struct InstalledSnapshot {
    pub state: InstalledState,
    pub snapshot: LibrarySnapshot,
    image_root: Option<PathBuf>,
    library_path: PathBuf,
    superseded: AtomicBool,
}

impl InstalledSnapshot {
    fn new(dir: &Path, state: InstalledState, snapshot: LibrarySnapshot) -> Self {
        let image_root = state.image_dir.as_ref().map(|d| dir.join(d));
        let library_path = dir.join(&state.library_file);
        Self {
            state,
            snapshot,
            image_root,
            library_path,
            superseded: AtomicBool::new(false),
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub fn version(&self) -> LibraryVersion {
        LibraryVersion::parse(&self.state.version)
    }

    /// Root of the extracted archive images, for archive installs
    pub fn image_root(&self) -> Option<&Path> {
        self.image_root.as_deref()
    }

    /// Where this version's images are read from
    pub fn resolve_context(&self) -> ResolveContext {
        ResolveContext {
            archive_root: self.image_root.clone(),
            remote_base_url: None,
        }
    }
}

impl Drop for InstalledSnapshot {
    fn drop(&mut self) {
        if !self.is_superseded() {
            return;
        }
        // Anything left behind here is swept at the next open
        let removed = std::fs::remove_file(&self.library_path).and_then(|()| {
            match &self.image_root {
                Some(root) => std::fs::remove_dir_all(root),
                None => Ok(()),
            }
        });
        match removed {
            Ok(()) => debug!(version = %self.state.version, "Removed superseded install files"),
            Err(e) => warn!(
                version = %self.state.version,
                error = %e,
                "Failed to remove superseded install files"
            ),
        }
    }
}

/// Keep version strings usable as file names
fn file_safe(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write `bytes` to `path` through a temporary file and a rename
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

async fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old install files"),
    }
}

/// Handle to the installed library shared by the engine and readers.
///
/// Readers take a cheap `Arc` of the current version and keep using it even
/// if a newer version is installed meanwhile.
#[derive(Debug)]
pub struct InstalledLibrary {
    dir: PathBuf,
    current: RwLock<Option<Arc<InstalledSnapshot>>>,
}

impl InstalledLibrary {
    /// Open the installed directory and load the committed version, if any
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::storage("Failed to create installed directory", e))?;

        let loaded = Self::load_committed(&dir).await;
        let current = match loaded {
            Ok(current) => {
                Self::sweep(&dir, current.as_ref().map(|c| &c.state)).await;
                current.map(Arc::new)
            }
            Err(e) => {
                // Leave files alone so nothing recoverable is deleted
                warn!(dir = %dir.display(), error = %e, "Installed library unreadable, starting empty");
                None
            }
        };

        if let Some(current) = &current {
            info!(
                version = %current.state.version,
                package_type = %current.state.package_type,
                "Installed library loaded"
            );
        }

        Ok(Self {
            dir,
            current: RwLock::new(current),
        })
    }

    async fn load_committed(dir: &Path) -> anyhow::Result<Option<InstalledSnapshot>> {
        let state_path = dir.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(None);
        }

        let state: InstalledState = serde_json::from_slice(&fs::read(&state_path).await?)?;
        let snapshot = LibrarySnapshot::load(&dir.join(&state.library_file)).await?;

        Ok(Some(InstalledSnapshot::new(dir, state, snapshot)))
    }

    /// Remove version files not referenced by `state` and leftover temp files
    async fn sweep(dir: &Path, state: Option<&InstalledState>) {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let referenced = state.is_some_and(|s| {
                s.library_file == name || s.image_dir.as_deref() == Some(name.as_str())
            });
            let versioned = name.starts_with("library-") || name.starts_with("images-");
            let temporary = name.ends_with(".tmp");

            if (versioned && !referenced) || temporary {
                remove_path(&entry.path()).await;
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current version, if one is installed
    pub fn current(&self) -> Option<Arc<InstalledSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> Option<LibraryVersion> {
        self.current().map(|c| c.version())
    }

    async fn lock(&self) -> Result<std::fs::File, SyncError> {
        let path = self.dir.join(LOCK_FILE);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("install lock task failed: {}", e)))?
        .map_err(|e| SyncError::storage("Failed to acquire install lock", e))
    }

    /// Install a verified package and make it current.
    ///
    /// Either the whole version becomes current or the previous one stays.
    pub(crate) async fn install(
        &self,
        package: VerifiedPackage,
    ) -> Result<Arc<InstalledSnapshot>, SyncError> {
        // Released when the file is dropped at the end of the install
        let _lock = self.lock().await?;

        let package_type = package.package_type();
        let (snapshot, bytes, images) = match package {
            VerifiedPackage::Json { snapshot, bytes } => (snapshot, bytes, None),
            VerifiedPackage::Archive { snapshot, images } => {
                let bytes = serde_json::to_vec(&snapshot)
                    .map_err(|e| SyncError::Internal(format!("serialize snapshot: {}", e)))?;
                (snapshot, bytes, Some(images))
            }
        };

        let tag = format!(
            "{}-{}",
            file_safe(snapshot.version()),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let library_file = format!("library-{}.json", tag);
        let image_dir = images.as_ref().map(|_| format!("images-{}", tag));

        let state = InstalledState {
            version: snapshot.version().to_string(),
            package_type,
            installed_at: Utc::now(),
            library_file: library_file.clone(),
            image_dir: image_dir.clone(),
            stats: snapshot.stats(),
        };

        let library_path = self.dir.join(&library_file);
        let image_root = image_dir.as_ref().map(|d| self.dir.join(d));

        let committed = async {
            fs::write(&library_path, &bytes)
                .await
                .map_err(|e| SyncError::storage("Failed to write library file", e))?;

            if let (Some(images), Some(root)) = (&images, &image_root) {
                fs::rename(images.path(), root)
                    .await
                    .map_err(|e| SyncError::storage("Failed to move images into place", e))?;
            }

            let state_bytes = serde_json::to_vec_pretty(&state)
                .map_err(|e| SyncError::Internal(format!("serialize install state: {}", e)))?;
            write_atomic(&self.dir.join(STATE_FILE), &state_bytes)
                .await
                .map_err(|e| SyncError::storage("Failed to commit install state", e))
        }
        .await;

        if let Err(e) = committed {
            warn!(version = %state.version, error = %e, "Install failed, keeping previous library");
            remove_path(&library_path).await;
            if let Some(root) = &image_root {
                remove_path(root).await;
            }
            return Err(e);
        }

        let installed = Arc::new(InstalledSnapshot::new(&self.dir, state, snapshot));

        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            current.replace(Arc::clone(&installed))
        };

        if let Some(previous) = previous {
            previous.superseded.store(true, Ordering::Release);
            // Readers still holding it keep its files until they let go
            if let Err(e) = tokio::task::spawn_blocking(move || drop(previous)).await {
                warn!(error = %e, "Failed to release previous install");
            }
        }

        info!(
            version = %installed.state.version,
            package_type = %package_type,
            "Library installed"
        );
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Session;
    use tempfile::TempDir;

    fn json_package(version: &str) -> VerifiedPackage {
        let snapshot =
            LibrarySnapshot::from_sessions(version, [Session::new(1, "Abwehr")]).unwrap();
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        VerifiedPackage::Json { snapshot, bytes }
    }

    #[tokio::test]
    async fn test_install_and_reopen() {
        let temp = TempDir::new().unwrap();
        let library = InstalledLibrary::open(temp.path()).await.unwrap();
        assert!(library.current().is_none());

        library.install(json_package("v14")).await.unwrap();
        library.install(json_package("v15")).await.unwrap();
        assert_eq!(library.version(), Some(LibraryVersion::parse("v15")));

        // Previous version's files are gone, only the current one is left
        let libraries = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("library-"))
            .count();
        assert_eq!(libraries, 1);

        let reopened = InstalledLibrary::open(temp.path()).await.unwrap();
        let current = reopened.current().unwrap();
        assert_eq!(current.state.version, "v15");
        assert_eq!(current.snapshot.len(), 1);
        assert!(current.image_root().is_none());
    }

    #[tokio::test]
    async fn test_reader_keeps_its_version_across_install() {
        let temp = TempDir::new().unwrap();
        let library = InstalledLibrary::open(temp.path()).await.unwrap();
        library.install(json_package("v1")).await.unwrap();

        let held = library.current().unwrap();
        library.install(json_package("v2")).await.unwrap();

        assert_eq!(held.state.version, "v1");
        assert_eq!(library.current().unwrap().state.version, "v2");
    }

    #[tokio::test]
    async fn test_open_sweeps_unreferenced_files() {
        let temp = TempDir::new().unwrap();
        {
            let library = InstalledLibrary::open(temp.path()).await.unwrap();
            library.install(json_package("v3")).await.unwrap();
        }
        std::fs::write(temp.path().join("library-v9-deadbeef.json"), b"{}").unwrap();
        std::fs::write(temp.path().join("state.json.1234.tmp"), b"{").unwrap();
        std::fs::create_dir(temp.path().join("images-v9-deadbeef")).unwrap();

        let library = InstalledLibrary::open(temp.path()).await.unwrap();
        assert_eq!(library.current().unwrap().state.version, "v3");
        assert!(!temp.path().join("library-v9-deadbeef.json").exists());
        assert!(!temp.path().join("state.json.1234.tmp").exists());
        assert!(!temp.path().join("images-v9-deadbeef").exists());
    }

    #[tokio::test]
    async fn test_unreadable_state_starts_empty_and_keeps_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(STATE_FILE), b"not json").unwrap();
        std::fs::write(temp.path().join("library-v1-00000000.json"), b"{}").unwrap();

        let library = InstalledLibrary::open(temp.path()).await.unwrap();
        assert!(library.current().is_none());
        assert!(temp.path().join("library-v1-00000000.json").exists());
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("v15"), "v15");
        assert_eq!(file_safe("2025/01 beta"), "2025_01_beta");
    }
}
