//! Canonical client paths.
//!
//! ```text
//! $HBLIB_HOME/
//!   installed/          committed library (see sync::installed)
//!   cache/assets/       remote image cache
//!   staging/            downloads in progress
//!   sync_events.jsonl   sync journal
//! ```

use std::path::PathBuf;

use anyhow::Result;

use crate::sync::SyncPaths;

/// All client paths under the configured home
pub fn sync_paths() -> Result<SyncPaths> {
    Ok(SyncPaths::under(&super::hblib_home()?))
}

/// Directory of the installed library
pub fn installed_dir() -> Result<PathBuf> {
    Ok(sync_paths()?.installed_dir)
}

/// Asset cache directory
pub fn cache_dir() -> Result<PathBuf> {
    Ok(sync_paths()?.cache_dir)
}

/// Sync journal file
pub fn sync_journal() -> Result<PathBuf> {
    Ok(sync_paths()?.journal_path)
}
