//! Record model for the drill library.
//!
//! This module contains the core data structures:
//! - Session / Drill / ImageRef: the content records produced by extraction
//! - LibrarySnapshot: an immutable, versioned set of sessions
//! - Manifest: the document a client polls to decide whether to sync
//! - LibraryVersion: the total order used to compare published versions

pub mod drill;
pub mod manifest;
pub mod session;
pub mod snapshot;
pub mod validation;
pub mod version;

// Re-export commonly used types
pub use drill::{Drill, DrillTags, DrillText, ImageRef, Phase};
pub use manifest::{LibraryStats, Manifest, PackageRef, PackageType};
pub use session::{Session, SessionId, TagSet};
pub use snapshot::LibrarySnapshot;
pub use validation::ValidationError;
pub use version::{LibraryVersion, VersionError};

/// Marker used by extraction for values it could not determine
pub const UNKNOWN: &str = "unbekannt";

/// Lenient minute parsing for extraction output.
///
/// Accepts integers and numeric strings; anything else falls back to `default`.
pub(crate) fn minutes_or<'de, D>(deserializer: D, default: u32) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let minutes = match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|m| u32::try_from(m).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    Ok(minutes.unwrap_or(default))
}
