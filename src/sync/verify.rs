//! Package verification and archive extraction.
//!
//! Nothing is installed until the whole package has been checked against
//! the manifest. Archive checks and extraction run on the blocking pool.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

use super::download::StagedPackage;
use super::state::SyncError;
use crate::domain::{LibrarySnapshot, LibraryVersion, Manifest, PackageType};
use crate::library::image_manifest::{image_manifest_entry, ImageManifest, LIBRARY_ENTRY};
use crate::library::resolver::{self, ResolveContext};

/// A package that passed verification
pub(crate) enum VerifiedPackage {
    /// Manifest form, with the bytes to install verbatim
    Json {
        snapshot: LibrarySnapshot,
        bytes: Vec<u8>,
    },

    /// Archive form, with its images extracted under an archive root
    Archive {
        snapshot: LibrarySnapshot,
        images: TempDir,
    },
}

impl VerifiedPackage {
    pub(crate) fn snapshot(&self) -> &LibrarySnapshot {
        match self {
            VerifiedPackage::Json { snapshot, .. } | VerifiedPackage::Archive { snapshot, .. } => {
                snapshot
            }
        }
    }

    pub(crate) fn package_type(&self) -> PackageType {
        match self {
            VerifiedPackage::Json { .. } => PackageType::Json,
            VerifiedPackage::Archive { .. } => PackageType::Zip,
        }
    }
}

/// Checks shared by both forms: version and stats agree with the manifest,
/// every session is structurally valid
fn check_against_manifest(
    snapshot: &LibrarySnapshot,
    manifest: &Manifest,
    archive_entries: Option<&HashSet<String>>,
) -> Result<(), SyncError> {
    if LibraryVersion::parse(snapshot.version()) != manifest.library_version() {
        return Err(SyncError::PackageCorrupt(format!(
            "package version {} does not match manifest version {}",
            snapshot.version(),
            manifest.version
        )));
    }

    for session in snapshot.sessions() {
        session.validate_with(archive_entries).map_err(SyncError::corrupt)?;
    }

    let stats = snapshot.stats();
    if stats != manifest.stats {
        return Err(SyncError::PackageCorrupt(format!(
            "stats mismatch: manifest declares {} sessions, {} drills, {} images; package has {}, {}, {}",
            manifest.stats.sessions,
            manifest.stats.drills,
            manifest.stats.images,
            stats.sessions,
            stats.drills,
            stats.images
        )));
    }

    Ok(())
}

fn verify_json(bytes: Vec<u8>, manifest: &Manifest) -> Result<VerifiedPackage, SyncError> {
    let snapshot = LibrarySnapshot::from_json(&bytes)
        .map_err(|e| SyncError::PackageCorrupt(format!("library JSON: {}", e)))?;

    check_against_manifest(&snapshot, manifest, None)?;

    // Manifest-form images must be fetchable on their own
    let context = ResolveContext::default();
    for session in snapshot.sessions() {
        for image in session.images() {
            resolver::resolve(image, &context).map_err(SyncError::corrupt)?;
        }
    }

    Ok(VerifiedPackage::Json { snapshot, bytes })
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>, SyncError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| SyncError::PackageCorrupt(format!("archive entry {}: {}", name, e)))?;

    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| SyncError::PackageCorrupt(format!("archive entry {}: {}", name, e)))?;
    Ok(bytes)
}

/// Copy one entry to `dest`. Read failures mean a damaged archive, write
/// failures mean local storage trouble.
fn extract_entry(
    archive: &mut ZipArchive<File>,
    name: &str,
    dest: &Path,
) -> Result<u64, SyncError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| SyncError::PackageCorrupt(format!("archive entry {}: {}", name, e)))?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::storage("Failed to create image directory", e))?;
    }
    let mut out =
        File::create(dest).map_err(|e| SyncError::storage("Failed to create image file", e))?;

    let mut buf = [0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = entry
            .read(&mut buf)
            .map_err(|e| SyncError::PackageCorrupt(format!("archive entry {}: {}", name, e)))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .map_err(|e| SyncError::storage("Failed to write image file", e))?;
        written += n as u64;
    }

    Ok(written)
}

fn verify_archive(
    file: File,
    manifest: &Manifest,
    staging_dir: &Path,
) -> Result<VerifiedPackage, SyncError> {
    let mut archive = ZipArchive::new(file)
        .map_err(|e| SyncError::PackageCorrupt(format!("not a readable archive: {}", e)))?;
    let entries: HashSet<String> = archive.file_names().map(str::to_string).collect();

    let snapshot = LibrarySnapshot::from_json(&read_entry(&mut archive, LIBRARY_ENTRY)?)
        .map_err(|e| SyncError::PackageCorrupt(format!("{}: {}", LIBRARY_ENTRY, e)))?;

    let manifest_entry = image_manifest_entry();
    let image_manifest: ImageManifest =
        serde_json::from_slice(&read_entry(&mut archive, &manifest_entry)?)
            .map_err(|e| SyncError::PackageCorrupt(format!("{}: {}", manifest_entry, e)))?;

    for listed in image_manifest.distinct_images() {
        let entry = resolver::archive_entry_from_manifest(listed);
        if !entries.contains(&entry) {
            return Err(SyncError::PackageCorrupt(format!(
                "image manifest lists {} but the archive has no entry {}",
                listed, entry
            )));
        }
    }

    check_against_manifest(&snapshot, manifest, Some(&entries))?;

    let images = tempfile::Builder::new()
        .prefix("images-")
        .tempdir_in(staging_dir)
        .map_err(|e| SyncError::storage("Failed to create extraction directory", e))?;

    let mut extracted = 0usize;
    let mut bytes = 0u64;
    for logical in snapshot.distinct_image_paths() {
        let entry = resolver::archive_entry_name(logical).map_err(SyncError::corrupt)?;
        if !entries.contains(&entry) {
            // Only images carrying a remote URL get here; they stay remote
            continue;
        }
        let dest = resolver::archive_path(images.path(), logical).map_err(SyncError::corrupt)?;
        bytes += extract_entry(&mut archive, &entry, &dest)?;
        extracted += 1;
    }

    debug!(extracted, bytes, "Archive images extracted");
    Ok(VerifiedPackage::Archive { snapshot, images })
}

/// Verify a staged package against its manifest
#[instrument(skip_all, fields(version = %manifest.version, bytes = staged.size()))]
pub(crate) async fn verify(
    staged: StagedPackage,
    manifest: &Manifest,
    staging_dir: &Path,
) -> Result<VerifiedPackage, SyncError> {
    let verified = match staged {
        StagedPackage::Json { bytes } => verify_json(bytes, manifest)?,
        StagedPackage::Archive { file, .. } => {
            let manifest = manifest.clone();
            let staging_dir: PathBuf = staging_dir.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let handle = file
                    .reopen()
                    .map_err(|e| SyncError::storage("Failed to reopen staged archive", e))?;
                // `file` is dropped with the closure, deleting the staged archive
                verify_archive(handle, &manifest, &staging_dir)
            })
            .await
            .map_err(|e| SyncError::Internal(format!("verification task failed: {}", e)))??
        }
    };

    let stats = verified.snapshot().stats();
    info!(
        sessions = stats.sessions,
        drills = stats.drills,
        images = stats.images,
        "Package verified"
    );
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Drill, ImageRef, PackageRef, Session, SessionId};
    use crate::library::images::ImageProvider;
    use crate::library::{build_archive_bytes, build_manifest_package, publish_manifest};
    use std::io;

    struct Blank;

    impl ImageProvider for Blank {
        fn open(&self, logical_path: &str) -> io::Result<Box<dyn Read>> {
            Ok(Box::new(io::Cursor::new(logical_path.as_bytes().to_vec())))
        }
    }

    fn snapshot() -> LibrarySnapshot {
        let session = Session::new(78, "Kreuzen")
            .with_drill(
                Drill::new("78-1", "Einlaufen")
                    .with_page(2)
                    .with_image(ImageRef::full_page(SessionId(78), 2)),
            )
            .with_drill(
                Drill::new("78-2", "Passen")
                    .with_page(3)
                    .with_image(ImageRef::full_page(SessionId(78), 3)),
            );
        LibrarySnapshot::from_sessions("v15", [session]).unwrap()
    }

    fn manifest_for(snapshot: &LibrarySnapshot, kind: PackageType) -> Manifest {
        publish_manifest(
            None,
            snapshot,
            PackageRef {
                url: "unused".into(),
                kind,
                sha256: None,
            },
            None,
        )
    }

    fn staged_archive(bytes: &[u8], dir: &Path) -> StagedPackage {
        let mut file = tempfile::NamedTempFile::new_in(dir).unwrap();
        file.write_all(bytes).unwrap();
        StagedPackage::Archive {
            file,
            size: bytes.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_archive_verifies_and_extracts() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let (bytes, _) = build_archive_bytes(&snapshot, &Blank).unwrap();
        let manifest = manifest_for(&snapshot, PackageType::Zip);

        let verified = verify(staged_archive(&bytes, temp.path()), &manifest, temp.path())
            .await
            .unwrap();

        match verified {
            VerifiedPackage::Archive { images, .. } => {
                let path = resolver::archive_path(
                    images.path(),
                    "drill_images/TE_078/TE_078_page_3.png",
                )
                .unwrap();
                assert_eq!(
                    std::fs::read(path).unwrap(),
                    b"drill_images/TE_078/TE_078_page_3.png"
                );
            }
            VerifiedPackage::Json { .. } => panic!("expected archive"),
        }
    }

    #[tokio::test]
    async fn test_stats_mismatch_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let (bytes, _) = build_archive_bytes(&snapshot, &Blank).unwrap();
        let mut manifest = manifest_for(&snapshot, PackageType::Zip);
        manifest.stats.drills += 1;

        let result = verify(staged_archive(&bytes, temp.path()), &manifest, temp.path()).await;
        assert!(matches!(result, Err(SyncError::PackageCorrupt(_))));
    }

    #[tokio::test]
    async fn test_garbage_archive_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let manifest = manifest_for(&snapshot, PackageType::Zip);

        let result = verify(
            staged_archive(b"not a zip", temp.path()),
            &manifest,
            temp.path(),
        )
        .await;
        assert!(matches!(result, Err(SyncError::PackageCorrupt(_))));
    }

    #[tokio::test]
    async fn test_json_package_verifies() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let bytes = build_manifest_package(&snapshot, "https://cdn.example").unwrap();
        let manifest = manifest_for(&snapshot, PackageType::Json);

        let verified = verify(StagedPackage::Json { bytes }, &manifest, temp.path())
            .await
            .unwrap();
        assert_eq!(verified.package_type(), PackageType::Json);
        assert_eq!(verified.snapshot().version(), "v15");
    }

    #[tokio::test]
    async fn test_json_without_remote_urls_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let manifest = manifest_for(&snapshot, PackageType::Json);

        let result = verify(StagedPackage::Json { bytes }, &manifest, temp.path()).await;
        assert!(matches!(result, Err(SyncError::PackageCorrupt(_))));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let snapshot = snapshot();
        let bytes = build_manifest_package(&snapshot, "https://cdn.example").unwrap();
        let mut manifest = manifest_for(&snapshot, PackageType::Json);
        manifest.version = "v16".into();

        let result = verify(StagedPackage::Json { bytes }, &manifest, temp.path()).await;
        assert!(matches!(result, Err(SyncError::PackageCorrupt(_))));
    }
}
