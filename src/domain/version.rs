//! Library version ordering.
//!
//! Version strings are compared segment by segment rather than as plain
//! strings, so `v2 < v15`. Rules:
//! - a leading `v` or `V` is ignored
//! - segments are separated by `.`, `-` or `_`
//! - numeric segments compare numerically, text segments lexicographically
//! - a numeric segment orders before a text segment
//! - missing trailing segments count as `0`, so `v15 == 15 == 15.0`

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Num(u64),
    Text(String),
}

const ZERO: Segment = Segment::Num(0);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Cannot derive a version newer than '{0}'; set one explicitly")]
    NoSuccessor(String),
}

/// A version string with a documented total order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LibraryVersion {
    raw: String,
    segments: Vec<Segment>,
}

impl LibraryVersion {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let segments = body
            .split(['.', '-', '_'])
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<u64>() {
                Ok(n) => Segment::Num(n),
                Err(_) => Segment::Text(s.to_lowercase()),
            })
            .collect();

        Self {
            raw: trimmed.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if `self` is strictly newer than `other`
    pub fn is_newer_than(&self, other: &LibraryVersion) -> bool {
        self > other
    }

    /// The next version: the last digit run of the raw string incremented.
    ///
    /// `v14 -> v15`, `1.2 -> 1.3`. A version without digits gets `.1`
    /// appended. Fails when the result would not order after `self`, as
    /// with a digit run that overflows or sits inside a text segment.
    pub fn bump(&self) -> Result<LibraryVersion, VersionError> {
        let raw = &self.raw;
        let next = match raw.rfind(|c: char| c.is_ascii_digit()).map(|i| i + 1) {
            None => Self::parse(&format!("{}.1", raw)),
            Some(end) => {
                let start = raw[..end]
                    .rfind(|c: char| !c.is_ascii_digit())
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let run = raw[start..end]
                    .parse::<u64>()
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| VersionError::NoSuccessor(raw.clone()))?;
                Self::parse(&format!("{}{}{}", &raw[..start], run, &raw[end..]))
            }
        };

        if next.is_newer_than(self) {
            Ok(next)
        } else {
            Err(VersionError::NoSuccessor(raw.clone()))
        }
    }
}

impl Ord for LibraryVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&ZERO);
            let b = other.segments.get(i).unwrap_or(&ZERO);
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for LibraryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LibraryVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LibraryVersion {}

impl From<String> for LibraryVersion {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for LibraryVersion {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<LibraryVersion> for String {
    fn from(version: LibraryVersion) -> Self {
        version.raw
    }
}

impl std::fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
