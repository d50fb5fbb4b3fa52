//! Versioned library snapshots.
//!
//! A snapshot is immutable once published: the merge engine builds a new one
//! from the previous snapshot instead of editing it in place.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::manifest::LibraryStats;
use super::session::{Session, SessionId};
use super::validation::ValidationError;

/// On-disk form: sessions as an array sorted by id
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(alias = "version")]
    library_version: String,
    #[serde(default)]
    sessions: Vec<Session>,
}

/// A complete library version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotFile", into = "SnapshotFile")]
pub struct LibrarySnapshot {
    version: String,
    sessions: BTreeMap<SessionId, Session>,
}

impl TryFrom<SnapshotFile> for LibrarySnapshot {
    type Error = ValidationError;

    fn try_from(file: SnapshotFile) -> Result<Self, Self::Error> {
        let mut sessions = BTreeMap::new();
        for session in file.sessions {
            let id = session.id;
            if sessions.insert(id, session).is_some() {
                return Err(ValidationError::DuplicateSession(id));
            }
        }

        Ok(Self {
            version: file.library_version,
            sessions,
        })
    }
}

impl From<LibrarySnapshot> for SnapshotFile {
    fn from(snapshot: LibrarySnapshot) -> Self {
        Self {
            library_version: snapshot.version,
            sessions: snapshot.sessions.into_values().collect(),
        }
    }
}

impl LibrarySnapshot {
    /// Create an empty snapshot
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            sessions: BTreeMap::new(),
        }
    }

    /// Build a snapshot from sessions, rejecting duplicate ids
    pub fn from_sessions(
        version: impl Into<String>,
        sessions: impl IntoIterator<Item = Session>,
    ) -> Result<Self, ValidationError> {
        Self::try_from(SnapshotFile {
            library_version: version.into(),
            sessions: sessions.into_iter().collect(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Sessions ordered by id
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn drill_count(&self) -> usize {
        self.sessions.values().map(|s| s.drills.len()).sum()
    }

    /// Distinct logical image paths across all drills
    pub fn distinct_image_paths(&self) -> BTreeSet<&str> {
        self.sessions
            .values()
            .flat_map(|s| s.images())
            .map(|image| image.logical_path.as_str())
            .collect()
    }

    /// Counts advertised in a published manifest
    pub fn stats(&self) -> LibraryStats {
        LibraryStats {
            sessions: self.len(),
            drills: self.drill_count(),
            images: self.distinct_image_paths().len(),
        }
    }

    pub(crate) fn insert(&mut self, session: Session) -> Option<Session> {
        self.sessions.insert(session.id, session)
    }

    pub(crate) fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub(crate) fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Parse a snapshot from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Load a snapshot file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .await
            .with_context(|| format!("Failed to read library: {}", path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse library: {}", path.display()))
    }

    /// Write the snapshot as pretty JSON, creating parent directories
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write library: {}", path.display()))?;

        Ok(())
    }
}
