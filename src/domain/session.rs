//! Training sessions and their tag sets.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use super::drill::{Drill, ImageRef};
use super::validation::ValidationError;
use super::UNKNOWN;

/// Default session length when extraction could not find one
pub const DEFAULT_SESSION_MINUTES: u32 = 90;

/// Stable session identifier, derived from the number in the source file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    /// Derive the session id from a source name such as `trainingseinheit 184.pdf`.
    ///
    /// Takes the first run of ASCII digits. Returns `None` if there is none.
    pub fn from_source_name(name: &str) -> Option<Self> {
        let start = name.find(|c: char| c.is_ascii_digit())?;
        let digits: String = name[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok().map(Self)
    }

    /// Directory key used in image paths (`TE_078`)
    pub fn key(&self) -> String {
        format!("TE_{:03}", self.0)
    }

    /// Prefix every drill id of this session must carry
    pub fn drill_prefix(&self) -> String {
        format!("{}-", self.0)
    }

    /// Get the raw value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-level tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet {
    #[serde(default = "unknown")]
    pub formation: String,

    /// Open vocabulary, not a closed enumeration
    #[serde(default = "unknown")]
    pub focus_area: String,

    #[serde(default)]
    pub concept_tags: BTreeSet<String>,

    #[serde(default)]
    pub equipment_tags: BTreeSet<String>,
}

impl Default for TagSet {
    fn default() -> Self {
        Self {
            formation: unknown(),
            focus_area: unknown(),
            concept_tags: BTreeSet::new(),
            equipment_tags: BTreeSet::new(),
        }
    }
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn default_session_minutes() -> u32 {
    DEFAULT_SESSION_MINUTES
}

fn session_minutes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    super::minutes_or(deserializer, DEFAULT_SESSION_MINUTES)
}

/// A training session with its ordered drills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// File the session was extracted from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,

    /// Unique, stable identifier
    pub id: SessionId,

    pub title: String,

    /// Total length in minutes (90 when extraction could not parse it)
    #[serde(
        default = "default_session_minutes",
        deserialize_with = "session_minutes"
    )]
    pub duration_total_min: u32,

    #[serde(default)]
    pub equipment: BTreeSet<String>,

    /// Drills in document order
    #[serde(default)]
    pub drills: Vec<Drill>,

    #[serde(default)]
    pub tags: TagSet,
}

impl Session {
    /// Create an empty session
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        Self {
            source_file: None,
            id: SessionId(id),
            title: title.into(),
            duration_total_min: DEFAULT_SESSION_MINUTES,
            equipment: BTreeSet::new(),
            drills: Vec::new(),
            tags: TagSet::default(),
        }
    }

    /// Append a drill
    pub fn with_drill(mut self, drill: Drill) -> Self {
        self.drills.push(drill);
        self
    }

    /// Directory key used in image paths
    pub fn key(&self) -> String {
        self.id.key()
    }

    /// All image references of all drills, in drill order
    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.drills.iter().flat_map(|d| d.images.iter())
    }

    /// Structural validation without archive context
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with(None)
    }

    /// Structural validation.
    ///
    /// With `archive_entries`, images without a remote URL must map to one of
    /// the given archive entry names.
    pub fn validate_with(
        &self,
        archive_entries: Option<&HashSet<String>>,
    ) -> Result<(), ValidationError> {
        if self.id.0 <= 0 {
            return Err(ValidationError::InvalidSessionId(self.id.0));
        }

        let mut ordinals = HashSet::new();
        for drill in &self.drills {
            let ordinal = drill.ordinal_in(self.id)?;
            if !ordinals.insert(ordinal) {
                return Err(ValidationError::DuplicateDrill {
                    session: self.id,
                    drill_id: drill.drill_id.clone(),
                });
            }
            drill.validate(archive_entries)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_source_name() {
        assert_eq!(
            SessionId::from_source_name("trainingseinheit 184.pdf"),
            Some(SessionId(184))
        );
        assert_eq!(SessionId::from_source_name("TE_078_v2.pdf"), Some(SessionId(78)));
        assert_eq!(SessionId::from_source_name("notes.pdf"), None);
    }

    #[test]
    fn test_session_key_is_zero_padded() {
        assert_eq!(SessionId(78).key(), "TE_078");
        assert_eq!(SessionId(184).key(), "TE_184");
        assert_eq!(SessionId(5).drill_prefix(), "5-");
    }

    #[test]
    fn test_extraction_defaults() {
        let session: Session = serde_json::from_str(
            r#"{"id": 12, "title": "Gegenstoß", "duration_total_min": "ca. neunzig"}"#,
        )
        .unwrap();

        assert_eq!(session.duration_total_min, DEFAULT_SESSION_MINUTES);
        assert_eq!(session.tags.formation, UNKNOWN);
        assert!(session.drills.is_empty());

        let session: Session =
            serde_json::from_str(r#"{"id": 12, "title": "x", "duration_total_min": 75}"#).unwrap();
        assert_eq!(session.duration_total_min, 75);
    }

    #[test]
    fn test_rejects_non_positive_id() {
        let session = Session::new(0, "Broken");
        assert!(matches!(
            session.validate(),
            Err(ValidationError::InvalidSessionId(0))
        ));
    }

    #[test]
    fn test_rejects_duplicate_drill_ordinal() {
        let session = Session::new(7, "Dup")
            .with_drill(Drill::new("7-1", "A"))
            .with_drill(Drill::new("7-1", "B"));

        assert!(matches!(
            session.validate(),
            Err(ValidationError::DuplicateDrill { .. })
        ));
    }

    #[test]
    fn test_rejects_foreign_drill_prefix() {
        let session = Session::new(7, "Mixed").with_drill(Drill::new("8-1", "A"));

        assert!(matches!(
            session.validate(),
            Err(ValidationError::DrillPrefixMismatch { .. })
        ));
    }
}
