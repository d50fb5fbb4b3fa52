//! The `update` operation: sources in, new library version out.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};

use super::sources::{load_records, scan_sources, SourceFile, SourceKind};
use crate::adapters::SessionExtractor;
use crate::domain::{LibrarySnapshot, LibraryVersion, Session};
use crate::library::{merge_with_policy, MergePolicy, MergeReport};

/// Options for an update run
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Version of the new snapshot. Defaults to the existing version bumped.
    pub version: Option<String>,
    pub policy: MergePolicy,
}

/// A source that could not be turned into sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Sessions gathered from a source directory
#[derive(Debug, Default)]
pub struct Collected {
    pub sessions: Vec<Session>,
    /// PDFs not extracted because their session is already in the library
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<SourceFailure>,
}

/// Outcome of an update run
#[derive(Debug)]
pub struct UpdateSummary {
    pub report: MergeReport,
    pub sources: usize,
    pub skipped_sources: Vec<PathBuf>,
    pub failures: Vec<SourceFailure>,
}

/// Turn sources into session records.
///
/// A failing source is recorded and does not stop the others.
pub async fn collect_sessions(
    sources: &[SourceFile],
    existing: &LibrarySnapshot,
    policy: MergePolicy,
    extractor: Option<&dyn SessionExtractor>,
) -> Collected {
    let mut collected = Collected::default();

    for source in sources {
        let loaded = match source.kind {
            SourceKind::Record => load_records(&source.path).await,
            SourceKind::Pdf => {
                let known = source.session_id.is_some_and(|id| existing.contains(id));
                if known && policy == MergePolicy::SkipExisting {
                    debug!(path = %source.path.display(), "Skipping PDF (session already in library)");
                    collected.skipped.push(source.path.clone());
                    continue;
                }

                match extractor {
                    Some(extractor) => extractor.extract(&source.path).await.map(|s| vec![s]),
                    None => Err(anyhow::anyhow!("No extractor configured for PDF sources")),
                }
            }
        };

        match loaded {
            Ok(sessions) => collected.sessions.extend(sessions),
            Err(e) => {
                warn!(path = %source.path.display(), error = %e, "Source failed");
                collected.failures.push(SourceFailure {
                    path: source.path.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    collected
}

/// Merge every new session found in `sources_dir` into `existing`
pub async fn update_library(
    existing: &LibrarySnapshot,
    sources_dir: &Path,
    options: &UpdateOptions,
    extractor: Option<&dyn SessionExtractor>,
) -> Result<UpdateSummary> {
    let sources = scan_sources(sources_dir)?;
    info!(
        dir = %sources_dir.display(),
        sources = sources.len(),
        existing = existing.len(),
        "Scanning sources"
    );

    let collected = collect_sessions(&sources, existing, options.policy, extractor).await;

    let version = match &options.version {
        Some(version) => version.clone(),
        None => LibraryVersion::parse(existing.version()).bump()?.to_string(),
    };

    let report = merge_with_policy(existing, collected.sessions, version, options.policy);

    Ok(UpdateSummary {
        report,
        sources: sources.len(),
        skipped_sources: collected.skipped,
        failures: collected.failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Drill, SessionId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Builds a one-drill session from the file name
    struct FakeExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionExtractor for FakeExtractor {
        async fn extract(&self, pdf: &Path) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = pdf.file_name().unwrap().to_string_lossy().to_string();
            let id = SessionId::from_source_name(&name).unwrap().get();
            Ok(Session::new(id, format!("TE {}", id))
                .with_drill(Drill::new(format!("{}-1", id), "Einlaufen")))
        }
    }

    fn existing() -> LibrarySnapshot {
        LibrarySnapshot::from_sessions(
            "v14",
            [1, 2, 3].map(|id| Session::new(id, "existing")),
        )
        .unwrap()
    }

    fn sources_dir(names: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for name in names {
            std::fs::write(temp.path().join(name), b"%PDF").unwrap();
        }
        temp
    }

    #[tokio::test]
    async fn test_update_extracts_only_new_sessions() {
        let dir = sources_dir(&["trainingseinheit 3.pdf", "trainingseinheit 4.pdf"]);
        let extractor = FakeExtractor {
            calls: AtomicUsize::new(0),
        };

        let summary = update_library(
            &existing(),
            dir.path(),
            &UpdateOptions::default(),
            Some(&extractor),
        )
        .await
        .unwrap();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.skipped_sources.len(), 1);
        assert_eq!(summary.report.snapshot.version(), "v15");
        assert_eq!(
            summary.report.snapshot.session_ids().map(|id| id.get()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let dir = sources_dir(&["trainingseinheit 4.pdf"]);
        let extractor = FakeExtractor {
            calls: AtomicUsize::new(0),
        };
        let options = UpdateOptions {
            version: Some("v15".into()),
            ..UpdateOptions::default()
        };

        let first = update_library(&existing(), dir.path(), &options, Some(&extractor))
            .await
            .unwrap();
        let second = update_library(&first.report.snapshot, dir.path(), &options, Some(&extractor))
            .await
            .unwrap();

        assert!(second.report.is_noop());
        assert_eq!(second.report.snapshot, first.report.snapshot);
    }

    #[tokio::test]
    async fn test_pdf_without_extractor_is_a_failure() {
        let dir = sources_dir(&["trainingseinheit 9.pdf"]);
        let summary = update_library(&existing(), dir.path(), &UpdateOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert!(summary.report.is_noop());
    }
}
