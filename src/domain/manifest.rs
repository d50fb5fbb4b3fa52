//! Top-level manifest published next to each package.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::LibraryVersion;

/// Default library identifier for new manifests
pub const DEFAULT_LIBRARY_ID: &str = "handball-training-library";

/// Default minimum app version for new manifests
pub const DEFAULT_MIN_APP_VERSION: &str = "1.0.0";

/// Package format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// Snapshot JSON with remote image URLs
    Json,

    /// Self-contained archive with embedded images
    Zip,
}

impl std::fmt::Display for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageType::Json => write!(f, "json"),
            PackageType::Zip => write!(f, "zip"),
        }
    }
}

impl std::str::FromStr for PackageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(PackageType::Json),
            "zip" | "hblib" | "archive" => Ok(PackageType::Zip),
            _ => anyhow::bail!("Unknown package type: {}", s),
        }
    }
}

/// Where to download the package and how to read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub url: String,

    #[serde(rename = "type")]
    pub kind: PackageType,

    /// Hex SHA-256 of the package bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Content counts of a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub sessions: usize,
    pub drills: usize,
    /// Distinct logical image paths
    pub images: usize,
}

/// The document clients poll to decide whether to sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub library_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub min_app_version: String,
    pub package: PackageRef,
    #[serde(default)]
    pub stats: LibraryStats,
    /// Newest entry first
    #[serde(default)]
    pub changelog: Vec<String>,
}

impl Manifest {
    /// Parse a manifest from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn library_version(&self) -> LibraryVersion {
        LibraryVersion::parse(&self.version)
    }

    /// Whether an app at `app_version` may install this library
    pub fn supports_app(&self, app_version: &str) -> bool {
        LibraryVersion::parse(app_version) >= LibraryVersion::parse(&self.min_app_version)
    }

    /// Prepend a changelog entry unless it is already recorded
    pub fn record_change(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        if !self.changelog.contains(&entry) {
            self.changelog.insert(0, entry);
        }
    }
}
