//! Client sync engine.
//!
//! One attempt walks `Checking -> (UpToDate | Downloading -> Verifying ->
//! Installing -> Installed)` and ends in `Failed` on any error. Concurrent
//! callers of [`SyncEngine::sync`] share the attempt already in flight, and
//! every manifest request ([`SyncEngine::check`] included) shares the fetch
//! already in flight.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::asset_cache::{AssetCache, AssetResult, CacheError};
use super::cancel::CancelToken;
use super::download;
use super::installed::{InstalledLibrary, InstalledSnapshot};
use super::journal::{SyncEvent, SyncJournal};
use super::state::{SyncError, SyncOutcome, SyncReport, SyncState};
use super::verify;
use crate::adapters::Fetcher;
use crate::domain::{ImageRef, Manifest};
use crate::library::resolver::{self, ByteSource, ResolveContext};

/// Client-side directories and files, all under one home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPaths {
    pub installed_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub journal_path: PathBuf,
}

impl SyncPaths {
    /// Standard layout under `home`
    pub fn under(home: &Path) -> Self {
        Self {
            installed_dir: home.join("installed"),
            cache_dir: home.join("cache").join("assets"),
            staging_dir: home.join("staging"),
            journal_path: home.join("sync_events.jsonl"),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub manifest_url: String,
    /// Compared against the manifest's `min_app_version`
    pub app_version: String,
    pub cache_max_bytes: u64,
    pub paths: SyncPaths,
}

/// Result of checking the manifest without installing
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub manifest: Manifest,
    pub installed: Option<String>,
    pub update_available: bool,
    pub compatible: bool,
}

type Inflight<T> = Mutex<Option<watch::Receiver<Option<T>>>>;

/// Clears the in-flight marker even if the leading caller is dropped
struct InflightGuard<'a, T>(&'a Inflight<T>);

impl<T> Drop for InflightGuard<'_, T> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

struct EngineInner {
    settings: SyncSettings,
    fetcher: Arc<dyn Fetcher>,
    installed: InstalledLibrary,
    cache: AssetCache,
    journal: SyncJournal,
    state: watch::Sender<SyncState>,
    inflight: Inflight<SyncOutcome>,
    manifest_fetch: Inflight<Result<Manifest, SyncError>>,
}

/// Keeps the local library in step with the published manifest
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the engine over the directories in `settings`.
    ///
    /// Loads the committed library and clears leftovers of interrupted
    /// downloads from the staging area.
    pub async fn open(settings: SyncSettings, fetcher: Arc<dyn Fetcher>) -> Result<Self, SyncError> {
        let paths = &settings.paths;

        if paths.staging_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&paths.staging_dir).await {
                warn!(dir = %paths.staging_dir.display(), error = %e, "Failed to clear staging area");
            }
        }

        let installed = InstalledLibrary::open(&paths.installed_dir).await?;
        let cache = AssetCache::open(&paths.cache_dir, settings.cache_max_bytes)
            .await
            .map_err(|e| SyncError::storage("Failed to open asset cache", e))?;
        let journal = SyncJournal::new(&paths.journal_path);
        let (state, _) = watch::channel(SyncState::Idle);

        debug!(
            manifest_url = %settings.manifest_url,
            fetcher = fetcher.name(),
            installed = ?installed.version().map(|v| v.to_string()),
            "Sync engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                fetcher,
                installed,
                cache,
                journal,
                state,
                inflight: Mutex::new(None),
                manifest_fetch: Mutex::new(None),
            }),
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// The installed version, if any.
    ///
    /// The returned snapshot stays valid while held, even across installs.
    pub fn installed(&self) -> Option<Arc<InstalledSnapshot>> {
        self.inner.installed.current()
    }

    pub fn library(&self) -> &InstalledLibrary {
        &self.inner.installed
    }

    pub fn journal(&self) -> &SyncJournal {
        &self.inner.journal
    }

    pub fn cache(&self) -> &AssetCache {
        &self.inner.cache
    }

    /// Fetch and parse the remote manifest.
    ///
    /// Joins a fetch already in flight. The fetch runs in its own task, so
    /// cancelling one caller does not fail the others.
    pub async fn fetch_manifest(&self, cancel: &CancelToken) -> Result<Manifest, SyncError> {
        let mut rx = {
            let mut slot = self
                .inner
                .manifest_fetch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => {
                    debug!("Joining manifest fetch in flight");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let _guard = InflightGuard(&engine.inner.manifest_fetch);
                        tx.send_replace(Some(engine.fetch_manifest_once().await));
                    });
                    rx
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            fetched = rx.wait_for(Option::is_some) => match fetched {
                Ok(result) => result
                    .clone()
                    .unwrap_or_else(|| Err(SyncError::Internal("manifest fetch lost".into()))),
                Err(_) => Err(SyncError::Internal("manifest fetch task ended".into())),
            },
        }
    }

    async fn fetch_manifest_once(&self) -> Result<Manifest, SyncError> {
        let url = &self.inner.settings.manifest_url;
        let bytes = self
            .inner
            .fetcher
            .fetch(url)
            .await
            .map_err(|e| SyncError::ManifestUnavailable(e.to_string()))?;

        Manifest::from_json(&bytes).map_err(|e| SyncError::ManifestInvalid(e.to_string()))
    }

    /// Compare the remote manifest with the installed version.
    ///
    /// Read-only: shares any manifest fetch in flight and leaves the sync
    /// state alone.
    pub async fn check(&self) -> Result<UpdateCheck, SyncError> {
        let manifest = self.fetch_manifest(&CancelToken::new()).await?;
        let installed = self.inner.installed.version();
        let update_available = installed
            .as_ref()
            .map_or(true, |v| manifest.library_version().is_newer_than(v));
        let compatible = manifest.supports_app(&self.inner.settings.app_version);

        Ok(UpdateCheck {
            installed: installed.map(|v| v.to_string()),
            update_available,
            compatible,
            manifest,
        })
    }

    /// Run a sync attempt, or wait for the one already running.
    ///
    /// `cancel` only applies to an attempt this call starts.
    pub async fn sync(&self, cancel: &CancelToken) -> SyncOutcome {
        let leader = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match inflight.as_ref() {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *inflight = Some(rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!("Joining sync attempt in flight");
                return match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone().unwrap_or(Err(SyncError::Cancelled)),
                    // The leading caller was dropped mid-attempt
                    Err(_) => Err(SyncError::Cancelled),
                };
            }
        };

        let guard = InflightGuard(&self.inner.inflight);
        let outcome = self.run_attempt(cancel).await;
        drop(guard);
        tx.send_replace(Some(outcome.clone()));

        outcome
    }

    async fn transition(&self, attempt: Uuid, state: SyncState) {
        info!(%attempt, state = %state, "Sync state");
        if let Err(e) = self
            .inner
            .journal
            .append(&SyncEvent::new(attempt, &state))
            .await
        {
            warn!(error = %e, "Failed to record sync event");
        }
        self.inner.state.send_replace(state);
    }

    #[instrument(skip_all, fields(manifest_url = %self.inner.settings.manifest_url))]
    async fn run_attempt(&self, cancel: &CancelToken) -> SyncOutcome {
        let attempt = Uuid::new_v4();
        self.transition(attempt, SyncState::Checking).await;

        let outcome = self.attempt(attempt, cancel).await;
        if let Err(error) = &outcome {
            warn!(%attempt, %error, "Sync failed");
            self.transition(
                attempt,
                SyncState::Failed {
                    error: error.clone(),
                },
            )
            .await;
        }

        outcome
    }

    async fn attempt(&self, attempt: Uuid, cancel: &CancelToken) -> SyncOutcome {
        let settings = &self.inner.settings;
        let manifest = self.fetch_manifest(cancel).await?;
        let remote = manifest.library_version();

        let previous = self.inner.installed.version();
        if let Some(installed) = &previous {
            if !remote.is_newer_than(installed) {
                self.transition(
                    attempt,
                    SyncState::UpToDate {
                        version: installed.to_string(),
                    },
                )
                .await;
                return Ok(SyncReport::UpToDate {
                    installed: installed.to_string(),
                    remote: remote.to_string(),
                });
            }
        }

        // Only guards a download; an installed version stays usable
        if !manifest.supports_app(&settings.app_version) {
            return Err(SyncError::IncompatibleApp {
                required: manifest.min_app_version.clone(),
                app: settings.app_version.clone(),
            });
        }

        cancel.check()?;
        let version = manifest.version.clone();
        self.transition(
            attempt,
            SyncState::Downloading {
                version: version.clone(),
                received_bytes: 0,
                total_bytes: None,
            },
        )
        .await;

        let state = &self.inner.state;
        let staged = download::download(
            self.inner.fetcher.as_ref(),
            &manifest.package,
            &settings.paths.staging_dir,
            cancel,
            |received, total| {
                state.send_replace(SyncState::Downloading {
                    version: version.clone(),
                    received_bytes: received,
                    total_bytes: total,
                });
            },
        )
        .await?;

        cancel.check()?;
        self.transition(
            attempt,
            SyncState::Verifying {
                version: version.clone(),
            },
        )
        .await;
        let verified = verify::verify(staged, &manifest, &settings.paths.staging_dir).await?;
        let package_type = verified.package_type();

        // Last point where cancelling is honoured
        cancel.check()?;
        self.transition(
            attempt,
            SyncState::Installing {
                version: version.clone(),
            },
        )
        .await;
        self.inner.installed.install(verified).await?;

        self.transition(
            attempt,
            SyncState::Installed {
                version: version.clone(),
            },
        )
        .await;

        Ok(SyncReport::Installed {
            version,
            previous: previous.map(|v| v.to_string()),
            package_type,
        })
    }

    /// Find an image reference by logical path in the installed library
    pub fn image_ref(&self, logical_path: &str) -> Option<ImageRef> {
        let current = self.installed()?;
        let found = current
            .snapshot
            .sessions()
            .flat_map(|s| s.images())
            .find(|image| image.logical_path == logical_path)
            .cloned();
        found
    }

    /// Bytes of an image of the installed library.
    ///
    /// Archive installs read from the extracted images. Otherwise the image's
    /// remote URL is fetched through the asset cache.
    pub async fn image(&self, image: &ImageRef) -> AssetResult {
        if let Some(current) = self.installed() {
            if current.image_root().is_some() {
                if let Ok(ByteSource::Archive(path)) =
                    resolver::resolve(image, &current.resolve_context())
                {
                    match tokio::fs::read(&path).await {
                        Ok(bytes) => return Ok(Arc::new(bytes)),
                        Err(e) if image.remote_url.is_none() => {
                            return Err(CacheError::Storage(format!(
                                "{}: {}",
                                path.display(),
                                e
                            )))
                        }
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "Archived image missing, using remote URL")
                        }
                    }
                }
            }
        }

        let url = match resolver::resolve(image, &ResolveContext::default()) {
            Ok(ByteSource::Remote(url)) => url,
            Ok(ByteSource::Archive(path)) => {
                return Err(CacheError::Unresolvable(path.display().to_string()))
            }
            Err(e) => return Err(CacheError::Unresolvable(e.to_string())),
        };

        self.inner
            .cache
            .get_or_fetch(&image.logical_path, &url, self.inner.fetcher.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FileFetcher;
    use tempfile::TempDir;

    fn settings(home: &Path, manifest_url: String) -> SyncSettings {
        SyncSettings {
            manifest_url,
            app_version: "1.0.0".to_string(),
            cache_max_bytes: 1024 * 1024,
            paths: SyncPaths::under(home),
        }
    }

    #[test]
    fn test_paths_layout() {
        let paths = SyncPaths::under(Path::new("/home/u/.hblib"));
        assert_eq!(paths.installed_dir, PathBuf::from("/home/u/.hblib/installed"));
        assert_eq!(paths.cache_dir, PathBuf::from("/home/u/.hblib/cache/assets"));
        assert_eq!(
            paths.journal_path,
            PathBuf::from("/home/u/.hblib/sync_events.jsonl")
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_and_is_journaled() {
        let temp = TempDir::new().unwrap();
        let url = temp.path().join("nope.json").to_string_lossy().to_string();
        let engine = SyncEngine::open(settings(temp.path(), url), Arc::new(FileFetcher::new()))
            .await
            .unwrap();

        let outcome = engine.sync(&CancelToken::new()).await;
        assert!(matches!(outcome, Err(SyncError::ManifestUnavailable(_))));
        assert!(matches!(engine.state(), SyncState::Failed { .. }));

        let last = engine.journal().last_attempt().await.unwrap().unwrap();
        assert_eq!(last.phase, crate::sync::SyncPhase::Failed);
    }

    #[tokio::test]
    async fn test_invalid_manifest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        tokio::fs::write(&path, b"{\"version\": 3}").await.unwrap();

        let engine = SyncEngine::open(
            settings(temp.path(), path.to_string_lossy().to_string()),
            Arc::new(FileFetcher::new()),
        )
        .await
        .unwrap();

        assert!(matches!(
            engine.sync(&CancelToken::new()).await,
            Err(SyncError::ManifestInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        tokio::fs::write(&path, b"{}").await.unwrap();
        let engine = SyncEngine::open(
            settings(temp.path(), path.to_string_lossy().to_string()),
            Arc::new(FileFetcher::new()),
        )
        .await
        .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(engine.sync(&cancel).await, Err(SyncError::Cancelled));
        assert!(engine.installed().is_none());
    }
}
