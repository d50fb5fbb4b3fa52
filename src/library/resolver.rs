//! Image path resolution.
//!
//! Images have one identity, the logical path
//! (`drill_images/<KEY>/<file>`), and two derived addresses:
//!
//! ```text
//! logical:  drill_images/TE_078/TE_078_page_2.png
//! archive:  images/drill_images_v2/TE_078/TE_078_page_2.png
//! manifest:        drill_images_v2/TE_078/TE_078_page_2.png   (relative to images/)
//! remote:   <base_url>/drill_images/TE_078/TE_078_page_2.png
//! ```
//!
//! Every translation between them goes through this module. The package
//! builder, the archive verifier and the installer never build these
//! strings themselves.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::ImageRef;

/// Root directory of logical image paths
pub const LOGICAL_ROOT: &str = "drill_images";

/// Image tree name inside archives
pub const ARCHIVE_IMAGE_ROOT: &str = "drill_images_v2";

/// Directory holding images and the image manifest inside archives
pub const ARCHIVE_IMAGES_DIR: &str = "images";

/// Errors from image resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Image path '{0}' is not of the form drill_images/<session>/<file>")]
    MalformedPath(String),

    #[error("Unresolvable image '{0}': no archive, base URL or remote URL available")]
    UnresolvableImage(String),
}

/// Where the bytes of an image can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    /// A file inside an archive root (an extracted archive or a staging dir)
    Archive(PathBuf),

    /// A remote URL
    Remote(String),
}

impl ByteSource {
    pub fn is_remote(&self) -> bool {
        matches!(self, ByteSource::Remote(_))
    }
}

/// What the consumer has available to read images from
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    /// Directory laid out like the archive (`images/drill_images_v2/...`)
    pub archive_root: Option<PathBuf>,

    /// Base URL the logical paths are published under
    pub remote_base_url: Option<String>,
}

impl ResolveContext {
    pub fn archive(root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: Some(root.into()),
            remote_base_url: None,
        }
    }

    pub fn remote(base_url: impl Into<String>) -> Self {
        Self {
            archive_root: None,
            remote_base_url: Some(base_url.into()),
        }
    }
}

/// Stable part of a logical path: `<KEY>/<file>`
fn stable_segment(logical_path: &str) -> Result<&str, ResolveError> {
    let rest = logical_path
        .strip_prefix(LOGICAL_ROOT)
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| ResolveError::MalformedPath(logical_path.to_string()))?;

    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(file), None) if !key.is_empty() && !file.is_empty() && key != ".." => {
            Ok(rest)
        }
        _ => Err(ResolveError::MalformedPath(logical_path.to_string())),
    }
}

/// Session key of a logical path (`TE_078`)
pub fn session_key(logical_path: &str) -> Result<&str, ResolveError> {
    stable_segment(logical_path).map(|s| s.split('/').next().unwrap_or(s))
}

/// Path of an image relative to the archive's `images/` directory.
///
/// This is the form listed in the internal image manifest.
pub fn manifest_entry(logical_path: &str) -> Result<String, ResolveError> {
    Ok(format!("{}/{}", ARCHIVE_IMAGE_ROOT, stable_segment(logical_path)?))
}

/// Full archive entry name of an image
pub fn archive_entry_name(logical_path: &str) -> Result<String, ResolveError> {
    Ok(format!(
        "{}/{}",
        ARCHIVE_IMAGES_DIR,
        manifest_entry(logical_path)?
    ))
}

/// Archive entry name for a path listed in the internal image manifest
pub fn archive_entry_from_manifest(manifest_path: &str) -> String {
    format!("{}/{}", ARCHIVE_IMAGES_DIR, manifest_path.trim_start_matches('/'))
}

/// Inverse of [`archive_entry_name`]
pub fn logical_from_archive_entry(entry: &str) -> Option<String> {
    let rest = entry
        .strip_prefix(ARCHIVE_IMAGES_DIR)?
        .strip_prefix('/')?
        .strip_prefix(ARCHIVE_IMAGE_ROOT)?
        .strip_prefix('/')?;
    let logical = format!("{}/{}", LOGICAL_ROOT, rest);
    stable_segment(&logical).ok()?;
    Some(logical)
}

/// Remote URL of an image under `base_url`
pub fn remote_url(base_url: &str, logical_path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        logical_path.trim_start_matches('/')
    )
}

/// Local file of an image under an archive root
pub fn archive_path(archive_root: &Path, logical_path: &str) -> Result<PathBuf, ResolveError> {
    let entry = archive_entry_name(logical_path)?;
    Ok(entry
        .split('/')
        .fold(archive_root.to_path_buf(), |path, part| path.join(part)))
}

/// Resolve an image to a byte source.
///
/// Order: archive root, then base URL, then the image's own remote URL.
pub fn resolve(image: &ImageRef, context: &ResolveContext) -> Result<ByteSource, ResolveError> {
    if let Some(root) = &context.archive_root {
        return archive_path(root, &image.logical_path).map(ByteSource::Archive);
    }

    if let Some(base) = &context.remote_base_url {
        return Ok(ByteSource::Remote(remote_url(base, &image.logical_path)));
    }

    match image.remote_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(ByteSource::Remote(url.to_string())),
        _ => Err(ResolveError::UnresolvableImage(image.logical_path.clone())),
    }
}
