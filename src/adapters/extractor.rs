//! External extraction tool adapter.
//!
//! PDF-to-record extraction is opaque to this crate. The configured command
//! is run as `<command> [args...] <pdf>` and must print one session record
//! as JSON on stdout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::SessionExtractor;
use crate::domain::{Session, SessionId};

/// Runs the extraction command as a subprocess
#[derive(Debug, Clone)]
pub struct ExtractorAdapter {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExtractorAdapter {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command and collect its stdout
    async fn run(&self, pdf: &Path) -> Result<String> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(pdf)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn extractor '{}'", self.command))?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Extractor timed out after {:?} on {}",
                    self.timeout,
                    pdf.display()
                )
            })?
            .with_context(|| format!("Failed to wait for extractor on {}", pdf.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Extractor failed on {} with exit code {}: {}",
                pdf.display(),
                exit_code,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("Extractor output is not valid UTF-8")
    }

    async fn extract_session(&self, pdf: &Path) -> Result<Session> {
        debug!(pdf = %pdf.display(), command = %self.command, "Extracting session");
        let stdout = self.run(pdf).await?;

        let mut session: Session = serde_json::from_str(stdout.trim())
            .with_context(|| format!("Extractor output for {} is not a session record", pdf.display()))?;

        let file_name = pdf
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if let Some(expected) = SessionId::from_source_name(&file_name) {
            if expected != session.id {
                warn!(
                    pdf = %pdf.display(),
                    expected = %expected,
                    extracted = %session.id,
                    "Extracted session id differs from file name"
                );
            }
        }

        if session.source_file.is_none() {
            session.source_file = Some(file_name);
        }

        Ok(session)
    }
}

#[async_trait]
impl SessionExtractor for ExtractorAdapter {
    async fn extract(&self, pdf: &Path) -> Result<Session> {
        self.extract_session(pdf).await
    }
}
