//! Source ingestion for library updates.
//!
//! ```text
//! sources/ (*.pdf, *.json) -> scan -> extract new sessions -> merge -> snapshot
//! ```
//!
//! PDFs whose session id is already in the library are skipped before the
//! extractor is run, so repeated updates over the same directory are cheap.

pub mod sources;
pub mod update;

pub use sources::{load_records, scan_sources, SourceFile, SourceKind};
pub use update::{collect_sessions, update_library, Collected, SourceFailure, UpdateOptions, UpdateSummary};
