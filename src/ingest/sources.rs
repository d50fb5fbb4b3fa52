//! Source directory scanning.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::{glob_with, MatchOptions, Pattern};
use serde::Deserialize;

use crate::domain::{Session, SessionId};

/// What a source file contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Already extracted session record(s) as JSON
    Record,
    /// Training plan PDF, needs the extractor
    Pdf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub kind: SourceKind,
    /// Derived from the file name, if it contains a number
    pub session_id: Option<SessionId>,
}

impl SourceFile {
    fn new(path: PathBuf, kind: SourceKind) -> Self {
        let session_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(SessionId::from_source_name);
        Self {
            path,
            kind,
            session_id,
        }
    }
}

/// List `*.pdf` and `*.json` files directly in `dir`, ordered by session id
/// (files without one last) and then by path
pub fn scan_sources(dir: &Path) -> Result<Vec<SourceFile>> {
    if !dir.is_dir() {
        anyhow::bail!("Source directory not found: {}", dir.display());
    }

    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let base = Pattern::escape(&dir.to_string_lossy());

    let mut sources = Vec::new();
    for (extension, kind) in [("pdf", SourceKind::Pdf), ("json", SourceKind::Record)] {
        let pattern = format!("{}/*.{}", base, extension);
        for entry in glob_with(&pattern, options)
            .with_context(|| format!("Invalid source pattern: {}", pattern))?
        {
            let path = entry.context("Failed to read source directory")?;
            if path.is_file() {
                sources.push(SourceFile::new(path, kind));
            }
        }
    }

    sources.sort_by(|a, b| {
        let key = |s: &SourceFile| (s.session_id.is_none(), s.session_id, s.path.clone());
        key(a).cmp(&key(b))
    });
    Ok(sources)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordFile {
    One(Box<Session>),
    Many(Vec<Session>),
}

/// Read a record file holding one session or an array of sessions
pub async fn load_records(path: &Path) -> Result<Vec<Session>> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read record: {}", path.display()))?;

    let records: RecordFile = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse record: {}", path.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string());

    let mut sessions = match records {
        RecordFile::One(session) => vec![*session],
        RecordFile::Many(sessions) => sessions,
    };
    for session in &mut sessions {
        if session.source_file.is_none() {
            session.source_file = file_name.clone();
        }
    }

    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_orders_by_session_id() {
        let temp = TempDir::new().unwrap();
        for name in [
            "trainingseinheit 184.pdf",
            "trainingseinheit 3.PDF",
            "notes.pdf",
            "78.json",
            "readme.txt",
        ] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }

        let sources = scan_sources(temp.path()).unwrap();
        let ids: Vec<_> = sources.iter().map(|s| s.session_id.map(|id| id.get())).collect();
        assert_eq!(ids, vec![Some(3), Some(78), Some(184), None]);
        assert_eq!(sources[1].kind, SourceKind::Record);
        assert_eq!(sources[0].kind, SourceKind::Pdf);
    }

    #[test]
    fn test_missing_directory() {
        assert!(scan_sources(Path::new("/definitely/not/here")).is_err());
    }

    #[tokio::test]
    async fn test_load_single_and_many() {
        let temp = TempDir::new().unwrap();
        let one = temp.path().join("te_5.json");
        std::fs::write(&one, r#"{"id": 5, "title": "Tempo"}"#).unwrap();
        let many = temp.path().join("batch.json");
        std::fs::write(
            &many,
            r#"[{"id": 6, "title": "A"}, {"id": 7, "title": "B", "source_file": "7.pdf"}]"#,
        )
        .unwrap();

        let sessions = load_records(&one).await.unwrap();
        assert_eq!(sessions[0].source_file.as_deref(), Some("te_5.json"));
        assert_eq!(sessions[0].duration_total_min, 90);

        let sessions = load_records(&many).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].source_file.as_deref(), Some("7.pdf"));
    }
}
