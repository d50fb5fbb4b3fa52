//! Local cache for remote image bytes.
//!
//! Files are stored under the hex SHA-256 of their logical path, with an
//! `index.json` recording size and last access. The cache is bounded by a
//! byte budget and evicts least recently used entries first. Concurrent
//! requests for the same key share one fetch.
//!
//! The index is written on every store and after every
//! [`HIT_FLUSH_INTERVAL`] hits, so a crash loses at most that many access
//! updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{FetchError, Fetcher};

const INDEX_FILE: &str = "index.json";

/// Cache hits between index writes
pub const HIT_FLUSH_INTERVAL: u32 = 16;

/// Errors from the asset cache
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Image cannot be resolved: {0}")]
    Unresolvable(String),

    #[error("Cache storage error: {0}")]
    Storage(String),
}

/// Result of one lookup, shared between coalesced callers
pub type AssetResult = Result<Arc<Vec<u8>>, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    file: String,
    size: u64,
    last_access: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    /// Logical access clock
    tick: u64,
    entries: HashMap<String, CacheEntry>,
    #[serde(skip)]
    unflushed_hits: u32,
}

impl CacheIndex {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn touch(&mut self, key: &str) -> Option<CacheEntry> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            entry.clone()
        })
    }

    /// Remove least recently used entries until the total fits `max_bytes`.
    /// Returns the removed file names.
    fn evict_to(&mut self, max_bytes: u64, keep: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut total = self.total_bytes();

        while total > max_bytes {
            let oldest = self
                .entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());

            let Some(key) = oldest else { break };
            if let Some(entry) = self.entries.remove(&key) {
                total -= entry.size;
                removed.push(entry.file);
            }
        }

        removed
    }
}

type Inflight = Mutex<HashMap<String, watch::Receiver<Option<AssetResult>>>>;

/// Clears an in-flight marker even if the fetching caller is dropped
struct InflightGuard<'a> {
    inflight: &'a Inflight,
    key: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
    }
}

fn file_name_for(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Bounded on-disk cache of remote assets
pub struct AssetCache {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
    inflight: Inflight,
    /// Serializes index writes so an older index never replaces a newer one
    persist: tokio::sync::Mutex<()>,
}

impl AssetCache {
    /// Open the cache directory, loading its index.
    ///
    /// Index entries whose file is missing are dropped.
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::Storage(format!("create {}: {}", dir.display(), e)))?;

        let index_path = dir.join(INDEX_FILE);
        let mut index = match fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice::<CacheIndex>(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Cache index unreadable, starting empty");
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        };
        index.entries.retain(|_, entry| dir.join(&entry.file).exists());

        debug!(
            entries = index.entries.len(),
            bytes = index.total_bytes(),
            max_bytes,
            "Asset cache opened"
        );

        Ok(Self {
            dir,
            max_bytes,
            index: Mutex::new(index),
            inflight: Mutex::new(HashMap::new()),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_bytes()
    }

    pub fn len(&self) -> usize {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(key)
    }

    /// Cached bytes for `key`, if present
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let (entry, flush_due) = {
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = index.touch(key)?;
            index.unflushed_hits += 1;
            (entry, index.unflushed_hits >= HIT_FLUSH_INTERVAL)
        };

        match fs::read(self.dir.join(&entry.file)).await {
            Ok(bytes) => {
                if flush_due {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Failed to persist cache access times");
                    }
                }
                Some(Arc::new(bytes))
            }
            Err(e) => {
                warn!(key, error = %e, "Cached file unreadable, dropping entry");
                self.index
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .remove(key);
                None
            }
        }
    }

    /// Cached bytes for `key`, fetching `url` on a miss.
    ///
    /// Only one fetch per key runs at a time; other callers wait for it.
    pub async fn get_or_fetch(&self, key: &str, url: &str, fetcher: &dyn Fetcher) -> AssetResult {
        if let Some(bytes) = self.get(key).await {
            return Ok(bytes);
        }

        let leader = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get(key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!(key, "Joining in-flight fetch");
                return match rx.wait_for(Option::is_some).await {
                    Ok(result) => result
                        .clone()
                        .unwrap_or_else(|| Err(CacheError::Storage("fetch abandoned".into()))),
                    Err(_) => Err(CacheError::Storage(format!("fetch of {} abandoned", key))),
                };
            }
        };

        let guard = InflightGuard {
            inflight: &self.inflight,
            key,
        };
        // A previous leader may have stored it since the first lookup
        let result = match self.get(key).await {
            Some(bytes) => Ok(bytes),
            None => self.fetch_and_store(key, url, fetcher).await,
        };
        drop(guard);
        tx.send_replace(Some(result.clone()));

        result
    }

    async fn fetch_and_store(&self, key: &str, url: &str, fetcher: &dyn Fetcher) -> AssetResult {
        debug!(key, url, fetcher = fetcher.name(), "Fetching asset");
        let bytes = Arc::new(fetcher.fetch(url).await?);

        if let Err(e) = self.store(key, &bytes).await {
            // The bytes are still good for this caller
            warn!(key, error = %e, "Failed to cache asset");
        }

        Ok(bytes)
    }

    /// Write `bytes` for `key` and evict down to the budget
    pub async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            debug!(key, size, max_bytes = self.max_bytes, "Asset larger than cache budget, not cached");
            return Ok(());
        }

        let file = file_name_for(key);
        fs::write(self.dir.join(&file), bytes)
            .await
            .map_err(|e| CacheError::Storage(format!("write {}: {}", file, e)))?;

        let evicted = {
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            index.tick += 1;
            let tick = index.tick;
            index.entries.insert(
                key.to_string(),
                CacheEntry {
                    file,
                    size,
                    last_access: tick,
                },
            );
            index.evict_to(self.max_bytes, key)
        };

        for file in &evicted {
            if let Err(e) = fs::remove_file(self.dir.join(file)).await {
                warn!(file, error = %e, "Failed to remove evicted asset");
            }
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), bytes = self.total_bytes(), "Asset cache trimmed");
        }

        self.flush().await
    }

    /// Persist the index, including access times
    pub async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.persist.lock().await;

        let bytes = {
            let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
            index.unflushed_hits = 0;
            serde_json::to_vec(&*index).map_err(|e| CacheError::Storage(e.to_string()))?
        };

        let path = self.dir.join(INDEX_FILE);
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", INDEX_FILE, Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| CacheError::Storage(format!("write index: {}", e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::Storage(format!("replace index: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves `len` bytes per URL and counts requests
    struct Counting {
        len: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Counting {
        fn new(len: usize) -> Self {
            Self {
                len,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Fetcher for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if url.contains("missing") {
                return Err(FetchError::NotFound(url.to_string()));
            }
            Ok(vec![1u8; self.len])
        }
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let temp = TempDir::new().unwrap();
        let cache = AssetCache::open(temp.path(), 1024).await.unwrap();
        let fetcher = Counting::new(10);

        cache.get_or_fetch("a", "https://cdn/a", &fetcher).await.unwrap();
        cache.get_or_fetch("a", "https://cdn/a", &fetcher).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_bytes(), 10);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_budget() {
        let temp = TempDir::new().unwrap();
        let cache = AssetCache::open(temp.path(), 25).await.unwrap();
        let fetcher = Counting::new(10);

        cache.get_or_fetch("a", "u/a", &fetcher).await.unwrap();
        cache.get_or_fetch("b", "u/b", &fetcher).await.unwrap();
        // Touch `a` so `b` becomes least recently used
        cache.get_or_fetch("a", "u/a", &fetcher).await.unwrap();
        cache.get_or_fetch("c", "u/c", &fetcher).await.unwrap();

        assert!(cache.total_bytes() <= 25);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(!temp.path().join(file_name_for("b")).exists());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(AssetCache::open(temp.path(), 1024).await.unwrap());
        let fetcher = Arc::new(Counting {
            delay: Duration::from_millis(50),
            ..Counting::new(10)
        });

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let fetcher = Arc::clone(&fetcher);
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("drill_images/TE_001/a.png", "u/a", fetcher.as_ref())
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 10);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let cache = AssetCache::open(temp.path(), 1024).await.unwrap();
            cache.store("k", b"bytes").await.unwrap();
        }

        let cache = AssetCache::open(temp.path(), 1024).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_slice(), b"bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_requests_fetch_each_key_once() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(AssetCache::open(temp.path(), 1 << 20).await.unwrap());
        let fetcher = Arc::new(Counting::new(4));

        for round in 0..50 {
            let key = format!("drill_images/TE_{:03}/page.png", round);
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let fetcher = Arc::clone(&fetcher);
                    let key = key.clone();
                    tokio::spawn(async move {
                        cache.get_or_fetch(&key, "u/x", fetcher.as_ref()).await
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }
        }

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_hits_are_persisted_for_lru_order() {
        let temp = TempDir::new().unwrap();
        {
            let cache = AssetCache::open(temp.path(), 25).await.unwrap();
            cache.store("a", &[0u8; 10]).await.unwrap();
            cache.store("b", &[0u8; 10]).await.unwrap();
            for _ in 0..HIT_FLUSH_INTERVAL {
                cache.get("a").await.unwrap();
            }
        }

        // `b` is least recently used after the reopen
        let cache = AssetCache::open(temp.path(), 25).await.unwrap();
        cache.store("c", &[0u8; 10]).await.unwrap();
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[tokio::test]
    async fn test_fetch_errors_are_not_cached() {
        let temp = TempDir::new().unwrap();
        let cache = AssetCache::open(temp.path(), 1024).await.unwrap();
        let fetcher = Counting::new(10);

        let err = cache.get_or_fetch("m", "u/missing", &fetcher).await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch(FetchError::NotFound(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_asset_is_served_but_not_cached() {
        let temp = TempDir::new().unwrap();
        let cache = AssetCache::open(temp.path(), 5).await.unwrap();
        let fetcher = Counting::new(10);

        let bytes = cache.get_or_fetch("big", "u/big", &fetcher).await.unwrap();
        assert_eq!(bytes.len(), 10);
        assert!(cache.is_empty());
    }
}
