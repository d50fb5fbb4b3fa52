//! Client-side sync: fetch the manifest, download and verify the package,
//! install it atomically and serve its images.

pub mod asset_cache;
pub mod cancel;
mod download;
pub mod engine;
pub mod installed;
pub mod journal;
pub mod state;
mod verify;

pub use asset_cache::{AssetCache, AssetResult, CacheError};
pub use cancel::CancelToken;
pub use engine::{SyncEngine, SyncPaths, SyncSettings, UpdateCheck};
pub use installed::{InstalledLibrary, InstalledSnapshot, InstalledState};
pub use journal::{AttemptSummary, SyncEvent, SyncJournal};
pub use state::{SyncError, SyncOutcome, SyncPhase, SyncReport, SyncState};
