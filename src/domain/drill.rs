//! Drills and the image references attached to them.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use super::session::SessionId;
use super::validation::ValidationError;
use super::UNKNOWN;
use crate::library::resolver;

/// Drill phase.
///
/// Open vocabulary: extraction may produce values outside [`Phase::SUGGESTED`],
/// and those are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub struct Phase(String);

impl Phase {
    /// Phases the extractor is known to produce
    pub const SUGGESTED: &'static [&'static str] = &[
        "Warm-up",
        "Koordination",
        "Ballhandling",
        "Torhüter",
        "Wurfserie",
        "Angriff",
        "Abwehr",
        "Spiel",
    ];

    pub fn new(phase: impl Into<String>) -> Self {
        Self::from(Some(phase.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    pub fn is_suggested(&self) -> bool {
        Self::SUGGESTED.contains(&self.0.as_str())
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self(UNKNOWN.to_string())
    }
}

impl From<Option<String>> for Phase {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) if !s.trim().is_empty() => Self(s.trim().to_string()),
            _ => Self::default(),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.0
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Condensed drill description kept for the app
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillText {
    #[serde(default)]
    pub setup: String,
    #[serde(default)]
    pub execution: String,
    #[serde(default)]
    pub coaching_points: String,
    #[serde(default)]
    pub variations: String,
}

/// Drill-level tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillTags {
    #[serde(default = "unknown")]
    pub formation: String,
    #[serde(default)]
    pub concept_tags: BTreeSet<String>,
    #[serde(default = "unknown")]
    pub drill_level: String,
    #[serde(default)]
    pub requires_goalkeeper: bool,
}

impl Default for DrillTags {
    fn default() -> Self {
        Self {
            formation: unknown(),
            concept_tags: BTreeSet::new(),
            drill_level: unknown(),
            requires_goalkeeper: false,
        }
    }
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

fn first_page() -> u32 {
    1
}

fn full_page() -> String {
    "full_page".to_string()
}

fn drill_minutes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    super::minutes_or(deserializer, 0)
}

/// Reference to a drill image.
///
/// `logical_path` is the only identity that survives format conversion;
/// archive entry names and remote URLs are derived from it by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Archive-relative path, e.g. `drill_images/TE_078/TE_078_page_2.png`
    #[serde(rename = "path", alias = "logical_path")]
    pub logical_path: String,

    /// Fully-qualified URL (manifest-form packages only)
    #[serde(
        rename = "url",
        alias = "remote_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_url: Option<String>,

    #[serde(default)]
    pub page: u32,

    #[serde(default)]
    pub order: u32,

    #[serde(rename = "type", default = "full_page")]
    pub kind: String,
}

impl ImageRef {
    /// Create a full-page image reference
    pub fn new(logical_path: impl Into<String>, page: u32, order: u32) -> Self {
        Self {
            logical_path: logical_path.into(),
            remote_url: None,
            page,
            order,
            kind: full_page(),
        }
    }

    /// Reference to the rendered page of a session (`TE_078_page_2.png`)
    pub fn full_page(session: SessionId, page: u32) -> Self {
        let key = session.key();
        Self::new(
            format!("{}/{}/{}_page_{}.png", resolver::LOGICAL_ROOT, key, key, page),
            page,
            1,
        )
    }

    /// Set the remote URL
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    fn has_remote_url(&self) -> bool {
        self.remote_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Check that at least one byte source can be derived for this image
    pub fn validate(
        &self,
        drill_id: &str,
        archive_entries: Option<&HashSet<String>>,
    ) -> Result<(), ValidationError> {
        if self.has_remote_url() {
            return Ok(());
        }

        let resolvable = match resolver::archive_entry_name(&self.logical_path) {
            Ok(entry) => archive_entries.map_or(true, |entries| entries.contains(&entry)),
            Err(_) => false,
        };

        if resolvable {
            Ok(())
        } else {
            Err(ValidationError::UnresolvableImageRef {
                drill_id: drill_id.to_string(),
                path: self.logical_path.clone(),
            })
        }
    }
}

/// A single drill within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drill {
    /// `<session_id>-<ordinal>`
    pub drill_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default, deserialize_with = "drill_minutes")]
    pub duration_min: u32,

    /// Running total within the session, as extracted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_min: Option<u32>,

    #[serde(default)]
    pub phase: Phase,

    /// First PDF page of the drill (1-based)
    #[serde(default = "first_page")]
    pub source_page_start: u32,

    #[serde(default)]
    pub text: DrillText,

    #[serde(default)]
    pub tags: DrillTags,

    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl Drill {
    pub fn new(drill_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            drill_id: drill_id.into(),
            title: title.into(),
            duration_min: 0,
            cumulative_min: None,
            phase: Phase::default(),
            source_page_start: 1,
            text: DrillText::default(),
            tags: DrillTags::default(),
            images: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Phase::new(phase);
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.source_page_start = page;
        self
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.images.push(image);
        self
    }

    /// Ordinal part of the drill id, checked against the owning session
    pub fn ordinal_in(&self, session: SessionId) -> Result<u32, ValidationError> {
        self.drill_id
            .strip_prefix(&session.drill_prefix())
            .and_then(|ordinal| ordinal.parse::<u32>().ok())
            .ok_or_else(|| ValidationError::DrillPrefixMismatch {
                session,
                drill_id: self.drill_id.clone(),
            })
    }

    pub fn validate(
        &self,
        archive_entries: Option<&HashSet<String>>,
    ) -> Result<(), ValidationError> {
        if self.source_page_start == 0 {
            return Err(ValidationError::InvalidPage {
                drill_id: self.drill_id.clone(),
            });
        }

        for image in &self.images {
            image.validate(&self.drill_id, archive_entries)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_is_open_vocabulary() {
        let drill: Drill =
            serde_json::from_str(r#"{"drill_id": "3-1", "phase": "Schnelle Mitte"}"#).unwrap();
        assert_eq!(drill.phase.as_str(), "Schnelle Mitte");
        assert!(!drill.phase.is_suggested());

        let drill: Drill = serde_json::from_str(r#"{"drill_id": "3-2", "phase": null}"#).unwrap();
        assert!(drill.phase.is_unknown());

        assert!(Phase::new("Angriff").is_suggested());
    }

    #[test]
    fn test_image_ref_field_names() {
        let image: ImageRef = serde_json::from_str(
            r#"{"path": "drill_images/TE_078/TE_078_page_2.png", "page": 2, "order": 1}"#,
        )
        .unwrap();
        assert_eq!(image.kind, "full_page");
        assert!(image.remote_url.is_none());

        let json = serde_json::to_value(image.with_remote_url("https://cdn/x.png")).unwrap();
        assert_eq!(json["url"], "https://cdn/x.png");
        assert_eq!(json["path"], "drill_images/TE_078/TE_078_page_2.png");

        let aliased: ImageRef = serde_json::from_str(
            r#"{"logical_path": "drill_images/TE_001/a.png", "remote_url": "https://cdn/a.png"}"#,
        )
        .unwrap();
        assert_eq!(aliased.remote_url.as_deref(), Some("https://cdn/a.png"));
    }

    #[test]
    fn test_full_page_reference() {
        let image = ImageRef::full_page(SessionId(78), 2);
        assert_eq!(image.logical_path, "drill_images/TE_078/TE_078_page_2.png");
        assert_eq!(image.page, 2);
    }

    #[test]
    fn test_image_validation_against_archive_entries() {
        let image = ImageRef::full_page(SessionId(78), 2);
        let mut entries = HashSet::new();

        assert!(image.validate("78-1", None).is_ok());
        assert!(image.validate("78-1", Some(&entries)).is_err());

        entries.insert("images/drill_images_v2/TE_078/TE_078_page_2.png".to_string());
        assert!(image.validate("78-1", Some(&entries)).is_ok());

        let stray = ImageRef::new("somewhere/else.png", 1, 1);
        assert!(stray.validate("78-1", None).is_err());
        assert!(stray
            .with_remote_url("https://cdn/else.png")
            .validate("78-1", None)
            .is_ok());
    }

    #[test]
    fn test_rejects_page_zero() {
        let drill = Drill::new("4-1", "Einlaufen").with_page(0);
        assert!(matches!(
            drill.validate(None),
            Err(ValidationError::InvalidPage { .. })
        ));
    }
}
