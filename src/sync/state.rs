//! Sync states, outcomes and the error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::PackageType;

/// Why a sync attempt failed.
///
/// Every variant leaves the previously installed library in place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The manifest could not be fetched. Retryable.
    #[error("Manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// The manifest was fetched but is not a valid manifest
    #[error("Manifest invalid: {0}")]
    ManifestInvalid(String),

    /// The library requires a newer app
    #[error("Library requires app version {required}, this app is {app}")]
    IncompatibleApp { required: String, app: String },

    /// The package could not be downloaded. Retryable.
    #[error("Package unavailable: {0}")]
    PackageUnavailable(String),

    /// The package failed verification
    #[error("Package corrupt: {0}")]
    PackageCorrupt(String),

    /// Staging or installing failed on the local filesystem
    #[error("Storage error: {0}")]
    StorageFull(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether retrying later may succeed without any change on either side
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ManifestUnavailable(_)
                | SyncError::PackageUnavailable(_)
                | SyncError::StorageFull(_)
                | SyncError::Cancelled
        )
    }

    pub(crate) fn storage(context: &str, error: impl std::fmt::Display) -> Self {
        SyncError::StorageFull(format!("{}: {}", context, error))
    }

    pub(crate) fn corrupt(error: impl std::fmt::Display) -> Self {
        SyncError::PackageCorrupt(error.to_string())
    }
}

/// Observable state of the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Checking,
    UpToDate {
        version: String,
    },
    Downloading {
        version: String,
        received_bytes: u64,
        total_bytes: Option<u64>,
    },
    Verifying {
        version: String,
    },
    Installing {
        version: String,
    },
    Installed {
        version: String,
    },
    Failed {
        error: SyncError,
    },
}

impl SyncState {
    pub fn phase(&self) -> SyncPhase {
        match self {
            SyncState::Idle => SyncPhase::Idle,
            SyncState::Checking => SyncPhase::Checking,
            SyncState::UpToDate { .. } => SyncPhase::UpToDate,
            SyncState::Downloading { .. } => SyncPhase::Downloading,
            SyncState::Verifying { .. } => SyncPhase::Verifying,
            SyncState::Installing { .. } => SyncPhase::Installing,
            SyncState::Installed { .. } => SyncPhase::Installed,
            SyncState::Failed { .. } => SyncPhase::Failed,
        }
    }

    /// Version the state refers to, if any
    pub fn version(&self) -> Option<&str> {
        match self {
            SyncState::UpToDate { version }
            | SyncState::Downloading { version, .. }
            | SyncState::Verifying { version }
            | SyncState::Installing { version }
            | SyncState::Installed { version } => Some(version),
            _ => None,
        }
    }

    /// True while an attempt is running
    pub fn is_busy(&self) -> bool {
        matches!(
            self.phase(),
            SyncPhase::Checking
                | SyncPhase::Downloading
                | SyncPhase::Verifying
                | SyncPhase::Installing
        )
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Downloading {
                version,
                received_bytes,
                total_bytes: Some(total),
            } => write!(f, "downloading {} ({}/{} bytes)", version, received_bytes, total),
            SyncState::Downloading {
                version,
                received_bytes,
                total_bytes: None,
            } => write!(f, "downloading {} ({} bytes)", version, received_bytes),
            SyncState::Failed { error } => write!(f, "failed: {}", error),
            other => match other.version() {
                Some(version) => write!(f, "{} {}", other.phase(), version),
                None => write!(f, "{}", other.phase()),
            },
        }
    }
}

/// State names without payload, as recorded in the sync journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Checking,
    UpToDate,
    Downloading,
    Verifying,
    Installing,
    Installed,
    Failed,
}

impl SyncPhase {
    /// Phases that end an attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::UpToDate | SyncPhase::Installed | SyncPhase::Failed
        )
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Checking => "checking",
            SyncPhase::UpToDate => "up_to_date",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Verifying => "verifying",
            SyncPhase::Installing => "installing",
            SyncPhase::Installed => "installed",
            SyncPhase::Failed => "failed",
        };
        f.pad(name)
    }
}

/// A successful sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Nothing to do: the remote version is not newer than the installed one
    UpToDate { installed: String, remote: String },

    /// A new version was installed
    Installed {
        version: String,
        previous: Option<String>,
        package_type: PackageType,
    },
}

impl SyncReport {
    /// The version installed after the attempt
    pub fn version(&self) -> &str {
        match self {
            SyncReport::UpToDate { installed, .. } => installed,
            SyncReport::Installed { version, .. } => version,
        }
    }
}

/// Result of one sync attempt, shared between coalesced callers
pub type SyncOutcome = Result<SyncReport, SyncError>;
