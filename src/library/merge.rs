//! Merge engine: combine a published snapshot with newly extracted sessions.
//!
//! The default policy never overwrites a session that is already present,
//! which makes re-running extraction over the same sources a no-op. It also
//! means corrections to an ingested session are not picked up; use
//! [`MergePolicy::Upsert`] explicitly for that.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::domain::{LibrarySnapshot, Session, SessionId, ValidationError};

/// How to treat an incoming session whose id already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep the existing session and report the incoming one as skipped
    #[default]
    SkipExisting,

    /// Replace sessions from the existing snapshot with the incoming version.
    /// Duplicates inside one batch are still first-wins.
    Upsert,
}

/// A record rejected during a merge
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position in the incoming batch
    pub index: usize,
    pub error: ValidationError,
}

/// Outcome of a merge
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub snapshot: LibrarySnapshot,
    pub added: BTreeSet<SessionId>,
    pub skipped: BTreeSet<SessionId>,
    /// Existing sessions replaced under [`MergePolicy::Upsert`]
    pub replaced: BTreeSet<SessionId>,
    pub rejected: Vec<RejectedRecord>,
}

impl MergeReport {
    /// True if the merge changed nothing but the version
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty()
    }
}

/// Merge with the default skip-if-present policy
pub fn merge(
    existing: &LibrarySnapshot,
    incoming: impl IntoIterator<Item = Session>,
    version: impl Into<String>,
) -> MergeReport {
    merge_with_policy(existing, incoming, version, MergePolicy::SkipExisting)
}

/// Merge `incoming` into a copy of `existing`.
///
/// Invalid records are rejected individually and the rest of the batch is
/// still merged. `version` is supplied by the caller; the engine does not
/// compute versions.
pub fn merge_with_policy(
    existing: &LibrarySnapshot,
    incoming: impl IntoIterator<Item = Session>,
    version: impl Into<String>,
    policy: MergePolicy,
) -> MergeReport {
    let mut snapshot = existing.clone();
    snapshot.set_version(version);

    let mut added = BTreeSet::new();
    let mut skipped = BTreeSet::new();
    let mut replaced = BTreeSet::new();
    let mut rejected = Vec::new();
    // Ids written by this batch, for first-wins within the batch
    let mut seen = BTreeSet::new();

    for (index, session) in incoming.into_iter().enumerate() {
        if let Err(error) = session.validate() {
            warn!(index, %error, "Rejecting session record");
            rejected.push(RejectedRecord { index, error });
            continue;
        }

        let id = session.id;
        let present = seen.contains(&id) || snapshot.contains(id);
        let upsert = policy == MergePolicy::Upsert && !seen.contains(&id);

        if present && !upsert {
            debug!(%id, "Skipping session (already in library)");
            skipped.insert(id);
            continue;
        }

        if snapshot.insert(session).is_some() {
            replaced.insert(id);
        } else {
            added.insert(id);
        }
        seen.insert(id);
    }

    info!(
        version = snapshot.version(),
        added = added.len(),
        skipped = skipped.len(),
        replaced = replaced.len(),
        rejected = rejected.len(),
        total = snapshot.len(),
        "Merged library"
    );

    MergeReport {
        snapshot,
        added,
        skipped,
        replaced,
        rejected,
    }
}
