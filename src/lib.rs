//! mnemon — consolidating knowledge store for AI-agent memories.
//! Online dedup at ingest, contradiction handling, batch cluster-and-merge
//! consolidation, crash-safe bulk ingest.

pub mod ai;
pub mod consolidate;
pub mod contradict;
pub mod db;
pub mod dedup;
pub mod embed;
pub mod error;
pub mod fingerprint;
pub mod prompts;
pub mod repair;
pub mod scoring;
pub mod thresholds;
pub mod unionfind;
pub mod util;

use std::sync::Arc;

pub type SharedStore = Arc<db::EntryStore>;

/// Run a blocking store operation on tokio's blocking thread pool.
///
/// All synchronous EntryStore calls in async context MUST go through this
/// to avoid starving tokio worker threads.
pub async fn store_call<F, T>(store: &SharedStore, f: F) -> Result<T, error::MnemonError>
where
    F: FnOnce(&db::EntryStore) -> T + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| error::MnemonError::Internal(e.to_string()))
}

use lru::LruCache;
use std::num::NonZeroUsize;

/// Per-run embedding cache keyed by content hash, so re-ingesting the same
/// text inside one run never pays for a second provider call.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl Default for EmbedCache {
    fn default() -> Self {
        Self::new(512)
    }
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap()),
                ),
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}
