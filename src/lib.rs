//! hblib - Handball training library packaging and sync
//!
//! Producer side: session records extracted from training-plan PDFs are
//! merged into versioned library snapshots and published as packages.
//! Client side: a sync engine keeps an installed copy in step with the
//! published manifest and serves drill images from the package or a cache.
//!
//! # Modules
//!
//! - `domain`: Records (Session, Drill, ImageRef), snapshots, manifests
//! - `library`: Merge engine, image resolver, package builder
//! - `ingest`: Source scanning and the update operation
//! - `sync`: Client sync engine, installed library, asset cache
//! - `adapters`: Transports (HTTP, file) and the external extractor
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Merge new PDFs into the library and bump its version
//! hblib update --sources pdfs/
//!
//! # Publish an archive with its manifest
//! hblib pack-archive --output dist/library_v15.hblib --manifest dist/manifest.json
//!
//! # Client: install the latest published version
//! hblib sync --manifest-url https://example.org/handball/manifest.json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod library;
pub mod sync;

// Re-export main types at crate root for convenience
pub use domain::{
    Drill, ImageRef, LibrarySnapshot, LibraryStats, LibraryVersion, Manifest, PackageRef,
    PackageType, Session, SessionId, ValidationError,
};
pub use library::{merge, merge_with_policy, resolve, MergePolicy, MergeReport};
pub use sync::{CancelToken, SyncEngine, SyncError, SyncReport, SyncSettings, SyncState};
