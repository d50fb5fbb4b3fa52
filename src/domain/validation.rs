//! Record validation errors.

use thiserror::Error;

use super::session::SessionId;

/// A malformed session, drill or image record.
///
/// Batch operations reject the offending record and keep going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Session id must be a positive integer, got {0}")]
    InvalidSessionId(i64),

    #[error("Drill '{drill_id}' does not belong to session {session}")]
    DrillPrefixMismatch { session: SessionId, drill_id: String },

    #[error("Drill '{drill_id}' appears more than once in session {session}")]
    DuplicateDrill { session: SessionId, drill_id: String },

    #[error("Drill '{drill_id}' has no valid source page")]
    InvalidPage { drill_id: String },

    #[error("Image '{path}' of drill '{drill_id}' has neither an archive entry nor a remote URL")]
    UnresolvableImageRef { drill_id: String, path: String },

    #[error("Session {0} appears more than once in the snapshot")]
    DuplicateSession(SessionId),
}

impl ValidationError {
    /// Session the error refers to, if known
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::DrillPrefixMismatch { session, .. } | Self::DuplicateDrill { session, .. } => {
                Some(*session)
            }
            Self::DuplicateSession(session) => Some(*session),
            Self::InvalidSessionId(id) => Some(SessionId(*id)),
            Self::InvalidPage { .. } | Self::UnresolvableImageRef { .. } => None,
        }
    }
}
