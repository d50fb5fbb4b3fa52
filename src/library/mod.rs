//! Server-side library tooling: merging and packaging.
//!
//! # Package Layout
//!
//! ```text
//! handball-library_v15.hblib (zip)
//! ├── library.json                          # LibrarySnapshot
//! └── images/
//!     ├── drill_images_manifest_v2.json     # drill -> image cross-reference
//!     └── drill_images_v2/
//!         └── <SESSION_KEY>/<file>.png      # each image stored once
//! ```
//!
//! The manifest form is just `library.json` with a `url` on every image.

pub mod image_manifest;
pub mod images;
pub mod merge;
pub mod package;
pub mod resolver;

pub use image_manifest::{ImageManifest, IMAGE_MANIFEST_FILE, LIBRARY_ENTRY};
pub use images::{DirImageProvider, ImageProvider};
pub use merge::{merge, merge_with_policy, MergePolicy, MergeReport, RejectedRecord};
pub use package::{
    build_archive, build_archive_bytes, build_manifest_package, package_sha256, package_sha256_reader,
    publish_manifest, ArchiveOptions, ArchiveReport, PackageError,
};
pub use resolver::{resolve, ByteSource, ResolveContext, ResolveError};
