//! Internal image manifest stored inside archive packages.
//!
//! Cross-references every archived image with the drills and sessions that
//! use it, so a consumer can check completeness without walking the drills.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resolver::{self, ARCHIVE_IMAGES_DIR, ARCHIVE_IMAGE_ROOT};
use crate::domain::{LibrarySnapshot, SessionId};

/// Archive entry holding the serialized snapshot
pub const LIBRARY_ENTRY: &str = "library.json";

/// File name of the image manifest inside `images/`
pub const IMAGE_MANIFEST_FILE: &str = "drill_images_manifest_v2.json";

/// Full archive entry name of the image manifest
pub fn image_manifest_entry() -> String {
    format!("{}/{}", ARCHIVE_IMAGES_DIR, IMAGE_MANIFEST_FILE)
}

/// Images of one drill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrillImages {
    pub session_id: SessionId,
    /// Paths relative to `images/` (`drill_images_v2/TE_078/TE_078_page_2.png`)
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub version: String,
    pub root: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    /// drill_id -> images
    #[serde(default)]
    pub drills: BTreeMap<String, DrillImages>,
}

impl ImageManifest {
    /// Build the manifest for a snapshot.
    ///
    /// Images whose logical path cannot be translated are left out; the
    /// builder removes them from the snapshot before calling this.
    pub fn for_snapshot(snapshot: &LibrarySnapshot) -> Self {
        let mut drills = BTreeMap::new();

        for session in snapshot.sessions() {
            for drill in &session.drills {
                let images: Vec<String> = drill
                    .images
                    .iter()
                    .filter_map(|image| resolver::manifest_entry(&image.logical_path).ok())
                    .collect();

                if !images.is_empty() {
                    drills.insert(
                        drill.drill_id.clone(),
                        DrillImages {
                            session_id: session.id,
                            images,
                        },
                    );
                }
            }
        }

        Self {
            version: "v2".to_string(),
            root: ARCHIVE_IMAGE_ROOT.to_string(),
            kind: "full_page_screenshots".to_string(),
            created_at: Utc::now(),
            drills,
        }
    }

    /// Distinct image paths (relative to `images/`)
    pub fn distinct_images(&self) -> BTreeSet<&str> {
        self.drills
            .values()
            .flat_map(|d| d.images.iter().map(String::as_str))
            .collect()
    }

    pub fn image_count(&self) -> usize {
        self.distinct_images().len()
    }
}
