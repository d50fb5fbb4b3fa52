//! Append-only journal of sync attempts.
//!
//! One JSON object per line. Each phase change of an attempt is recorded, so
//! the journal answers "when did we last sync and how did it go" without
//! keeping the engine running.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use super::state::{SyncPhase, SyncState};

/// One recorded phase change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub phase: SyncPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncEvent {
    pub fn new(attempt_id: Uuid, state: &SyncState) -> Self {
        let error = match state {
            SyncState::Failed { error } => Some(error.to_string()),
            _ => None,
        };

        Self {
            id: Uuid::new_v4(),
            attempt_id,
            timestamp: Utc::now(),
            phase: state.phase(),
            version: state.version().map(str::to_string),
            error,
        }
    }
}

/// Summary of one attempt, folded from its events
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub attempt_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last recorded phase
    pub phase: SyncPhase,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// File-based journal using JSONL format
#[derive(Debug, Clone)]
pub struct SyncJournal {
    path: PathBuf,
}

impl SyncJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event to the journal
    pub async fn append(&self, event: &SyncEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open sync journal: {}", self.path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize sync event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write sync event")?;
        file.flush().await.context("Failed to flush sync event")?;

        Ok(())
    }

    /// Replay all events in order.
    ///
    /// A torn last line (crash mid-write) is skipped with a warning.
    pub async fn replay(&self) -> Result<Vec<SyncEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open sync journal: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SyncEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "Skipping unreadable sync journal line"),
            }
        }

        Ok(events)
    }

    /// Attempts in chronological order, folded from the events
    pub async fn attempts(&self) -> Result<Vec<AttemptSummary>> {
        let mut attempts: Vec<AttemptSummary> = Vec::new();

        for event in self.replay().await? {
            match attempts.iter_mut().find(|a| a.attempt_id == event.attempt_id) {
                Some(attempt) => {
                    attempt.phase = event.phase;
                    if event.version.is_some() {
                        attempt.version = event.version;
                    }
                    if event.error.is_some() {
                        attempt.error = event.error;
                    }
                    if event.phase.is_terminal() {
                        attempt.finished_at = Some(event.timestamp);
                    }
                }
                None => attempts.push(AttemptSummary {
                    attempt_id: event.attempt_id,
                    started_at: event.timestamp,
                    finished_at: event.phase.is_terminal().then_some(event.timestamp),
                    phase: event.phase,
                    version: event.version,
                    error: event.error,
                }),
            }
        }

        Ok(attempts)
    }

    /// Most recent attempt, if any
    pub async fn last_attempt(&self) -> Result<Option<AttemptSummary>> {
        Ok(self.attempts().await?.pop())
    }

    /// Get the last event of a specific phase
    pub async fn last_event_of_phase(&self, phase: SyncPhase) -> Result<Option<SyncEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.phase == phase))
    }
}
