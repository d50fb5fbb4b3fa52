//! Package builder.
//!
//! Two distributable forms:
//! - archive (`.hblib`): zip with `library.json`, the internal image manifest
//!   and every referenced image stored once
//! - manifest form: snapshot JSON where every image carries a remote URL
//!
//! Plus the top-level [`Manifest`] a client polls.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Seek, Write};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::image_manifest::{image_manifest_entry, ImageManifest, LIBRARY_ENTRY};
use super::images::ImageProvider;
use super::resolver::{self, ResolveError};
use crate::domain::manifest::{DEFAULT_LIBRARY_ID, DEFAULT_MIN_APP_VERSION};
use crate::domain::{LibrarySnapshot, Manifest, PackageRef};

/// Errors while building a package
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An image that could not be packaged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedImage {
    pub logical_path: String,
    /// Drills the image was removed from
    pub drill_ids: Vec<String>,
    pub reason: String,
}

/// Result of building an archive
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    /// The snapshot as written into the archive
    pub snapshot: LibrarySnapshot,
    /// Physical image entries written
    pub images_written: usize,
    /// Image references across all drills
    pub image_references: usize,
    pub unresolved: Vec<UnresolvedImage>,
}

/// Archive writing options
#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    /// Write JSON entries without indentation
    pub compact_json: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self { compact_json: true }
    }
}

fn to_json(value: &impl serde::Serialize, compact: bool) -> Result<Vec<u8>, serde_json::Error> {
    if compact {
        serde_json::to_vec(value)
    } else {
        serde_json::to_vec_pretty(value)
    }
}

/// Write an archive package.
///
/// Images the provider cannot supply are logged, removed from the drills
/// that reference them (the drills are kept) and listed in the report.
#[instrument(skip_all, fields(version = snapshot.version()))]
pub fn build_archive<W: Write + Seek>(
    snapshot: &LibrarySnapshot,
    provider: &dyn ImageProvider,
    writer: W,
    options: ArchiveOptions,
) -> Result<(W, ArchiveReport), PackageError> {
    let file_options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(writer);

    // logical path -> drills referencing it
    let mut references: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for session in snapshot.sessions() {
        for drill in &session.drills {
            for image in &drill.images {
                references
                    .entry(image.logical_path.as_str())
                    .or_default()
                    .push(drill.drill_id.clone());
            }
        }
    }
    let image_references = references.values().map(Vec::len).sum();

    let mut unresolved = Vec::new();
    let mut images_written = 0;

    for (logical_path, drill_ids) in &references {
        let opened = resolver::archive_entry_name(logical_path)
            .map_err(|e| e.to_string())
            .and_then(|entry| {
                provider
                    .open(logical_path)
                    .map(|reader| (entry, reader))
                    .map_err(|e| e.to_string())
            });

        match opened {
            Ok((entry, mut reader)) => {
                zip.start_file(entry.as_str(), file_options)?;
                io::copy(&mut reader, &mut zip)?;
                images_written += 1;
                if images_written % 50 == 0 {
                    debug!(images_written, total = references.len(), "Archive progress");
                }
            }
            Err(reason) => {
                let error = ResolveError::UnresolvableImage(logical_path.to_string());
                warn!(%error, %reason, drills = ?drill_ids, "Image left out of archive");
                unresolved.push(UnresolvedImage {
                    logical_path: logical_path.to_string(),
                    drill_ids: drill_ids.clone(),
                    reason,
                });
            }
        }
    }

    let mut packaged = snapshot.clone();
    if !unresolved.is_empty() {
        let missing: BTreeSet<&str> = unresolved
            .iter()
            .map(|u| u.logical_path.as_str())
            .collect();
        for session in packaged.sessions_mut() {
            for drill in &mut session.drills {
                drill
                    .images
                    .retain(|image| !missing.contains(image.logical_path.as_str()));
            }
        }
    }

    let image_manifest = ImageManifest::for_snapshot(&packaged);
    zip.start_file(image_manifest_entry().as_str(), file_options)?;
    zip.write_all(&to_json(&image_manifest, options.compact_json)?)?;

    zip.start_file(LIBRARY_ENTRY, file_options)?;
    zip.write_all(&to_json(&packaged, options.compact_json)?)?;

    let writer = zip.finish()?;

    info!(
        sessions = packaged.len(),
        drills = packaged.drill_count(),
        image_references,
        images_written,
        unresolved = unresolved.len(),
        "Archive package built"
    );

    Ok((
        writer,
        ArchiveReport {
            snapshot: packaged,
            images_written,
            image_references,
            unresolved,
        },
    ))
}

/// Build an archive package in memory
pub fn build_archive_bytes(
    snapshot: &LibrarySnapshot,
    provider: &dyn ImageProvider,
) -> Result<(Vec<u8>, ArchiveReport), PackageError> {
    let (cursor, report) = build_archive(
        snapshot,
        provider,
        Cursor::new(Vec::new()),
        ArchiveOptions::default(),
    )?;
    Ok((cursor.into_inner(), report))
}

/// Copy of `snapshot` with every image's remote URL derived from `base_url`
pub fn with_remote_urls(snapshot: &LibrarySnapshot, base_url: &str) -> LibrarySnapshot {
    let mut remote = snapshot.clone();
    for session in remote.sessions_mut() {
        for drill in &mut session.drills {
            for image in &mut drill.images {
                image.remote_url = Some(resolver::remote_url(base_url, &image.logical_path));
            }
        }
    }
    remote
}

/// Build the manifest-form package: compact snapshot JSON, no binary data
pub fn build_manifest_package(
    snapshot: &LibrarySnapshot,
    base_url: &str,
) -> Result<Vec<u8>, PackageError> {
    let remote = with_remote_urls(snapshot, base_url);
    let bytes = serde_json::to_vec(&remote)?;

    info!(
        version = remote.version(),
        bytes = bytes.len(),
        images = remote.stats().images,
        base_url,
        "Manifest-form package built"
    );

    Ok(bytes)
}

/// Hex SHA-256 of package bytes
pub fn package_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 and length of a package read as a stream
pub fn package_sha256_reader(mut reader: impl Read) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = io::copy(&mut reader, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Build the top-level manifest for a published package.
///
/// `library_id`, `min_app_version` and the changelog carry over from
/// `previous`; the changelog entry is prepended once.
pub fn publish_manifest(
    previous: Option<Manifest>,
    snapshot: &LibrarySnapshot,
    package: PackageRef,
    change: Option<&str>,
) -> Manifest {
    let (library_id, min_app_version, changelog) = match previous {
        Some(previous) => (
            previous.library_id,
            previous.min_app_version,
            previous.changelog,
        ),
        None => (
            DEFAULT_LIBRARY_ID.to_string(),
            DEFAULT_MIN_APP_VERSION.to_string(),
            Vec::new(),
        ),
    };

    let mut manifest = Manifest {
        library_id,
        version: snapshot.version().to_string(),
        created_at: Utc::now(),
        min_app_version,
        package,
        stats: snapshot.stats(),
        changelog,
    };

    let entry = match change {
        Some(note) => format!("{}: {}", snapshot.version(), note),
        None => format!(
            "{}: {} sessions, {} drills",
            snapshot.version(),
            manifest.stats.sessions,
            manifest.stats.drills
        ),
    };
    manifest.record_change(entry);

    manifest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;

    use crate::domain::{Drill, ImageRef, PackageType, Session, SessionId};
    use zip::ZipArchive;

    struct MapProvider(HashMap<String, Vec<u8>>);

    impl ImageProvider for MapProvider {
        fn open(&self, logical_path: &str) -> io::Result<Box<dyn io::Read>> {
            self.0
                .get(logical_path)
                .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn io::Read>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, logical_path.to_string()))
        }
    }

    fn snapshot() -> LibrarySnapshot {
        let id = SessionId(78);
        let session = Session::new(78, "Kreuzen")
            .with_drill(
                Drill::new("78-1", "Einlaufen")
                    .with_page(2)
                    .with_image(ImageRef::full_page(id, 2)),
            )
            .with_drill(
                Drill::new("78-2", "Passen")
                    .with_page(2)
                    .with_image(ImageRef::full_page(id, 2)),
            )
            .with_drill(
                Drill::new("78-3", "Abschluss")
                    .with_page(3)
                    .with_image(ImageRef::full_page(id, 3)),
            );
        LibrarySnapshot::from_sessions("v15", [session]).unwrap()
    }

    fn provider(pages: &[u32]) -> MapProvider {
        MapProvider(
            pages
                .iter()
                .map(|p| {
                    (
                        ImageRef::full_page(SessionId(78), *p).logical_path,
                        format!("page {}", p).into_bytes(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_archive_dedups_shared_images() {
        let (bytes, report) = build_archive_bytes(&snapshot(), &provider(&[2, 3])).unwrap();

        assert_eq!(report.image_references, 3);
        assert_eq!(report.images_written, 2);
        assert!(report.unresolved.is_empty());

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert_eq!(
            names
                .iter()
                .filter(|n| n.ends_with("TE_078_page_2.png"))
                .count(),
            1
        );
        assert!(names.contains(&"library.json".to_string()));
        assert!(names.contains(&"images/drill_images_manifest_v2.json".to_string()));

        let mut content = String::new();
        archive
            .by_name("images/drill_images_v2/TE_078/TE_078_page_3.png")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "page 3");
    }

    #[test]
    fn test_missing_image_keeps_drill() {
        let (bytes, report) = build_archive_bytes(&snapshot(), &provider(&[2])).unwrap();

        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].drill_ids, vec!["78-3".to_string()]);

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut json = Vec::new();
        archive
            .by_name("library.json")
            .unwrap()
            .read_to_end(&mut json)
            .unwrap();
        let packaged = LibrarySnapshot::from_json(&json).unwrap();
        let session = packaged.get(SessionId(78)).unwrap();
        assert_eq!(session.drills.len(), 3);
        assert!(session.drills[2].images.is_empty());
    }

    #[test]
    fn test_manifest_package_has_remote_urls() {
        let bytes = build_manifest_package(&snapshot(), "https://cdn.example/hb/").unwrap();
        let remote = LibrarySnapshot::from_json(&bytes).unwrap();

        for image in remote.sessions().flat_map(|s| s.images()) {
            assert_eq!(
                image.remote_url.as_deref().unwrap(),
                format!("https://cdn.example/hb/{}", image.logical_path)
            );
        }
    }

    #[test]
    fn test_publish_manifest_stats_and_changelog() {
        let snapshot = snapshot();
        let package = PackageRef {
            url: "https://cdn.example/hb/library_v15.json".to_string(),
            kind: PackageType::Json,
            sha256: None,
        };

        let first = publish_manifest(None, &snapshot, package.clone(), Some("Remote images"));
        assert_eq!(first.library_id, DEFAULT_LIBRARY_ID);
        assert_eq!(first.stats.images, snapshot.distinct_image_paths().len());
        assert_eq!(first.stats.images, 2);
        assert_eq!(first.changelog, vec!["v15: Remote images".to_string()]);

        let again = publish_manifest(Some(first), &snapshot, package, Some("Remote images"));
        assert_eq!(again.changelog.len(), 1);
    }

    #[test]
    fn test_package_sha256() {
        assert_eq!(
            package_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streamed_sha256_matches_in_memory() {
        let (bytes, _) = build_archive_bytes(&snapshot(), &provider(&[2, 3])).unwrap();
        let (streamed, size) = package_sha256_reader(Cursor::new(&bytes)).unwrap();

        assert_eq!(streamed, package_sha256(&bytes));
        assert_eq!(size, bytes.len() as u64);
    }
}
