//! LRU cache of routed results in front of the orchestrator.
//!
//! Each entry remembers the store write generation it was computed under. A lookup
//! under any other generation is a miss, so a result computed while a write landed
//! is never served after that write.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::expander::normalize;
use super::RetrievalResult;

/// Identity of one retrieval: project, normalized query, `top_k`, and threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey(blake3::Hash);

impl QueryKey {
    pub fn new(project_id: &str, query: &str, top_k: usize, min_confidence: f64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(project_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(normalize(query).as_bytes());
        hasher.update(&[0]);
        hasher.update(&(top_k as u64).to_le_bytes());
        hasher.update(&min_confidence.to_bits().to_le_bytes());
        Self(hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
}

struct CachedResult {
    result: RetrievalResult,
    generation: u64,
    stored_at: Instant,
}

/// Bounded result cache. A capacity of zero disables caching; every `get` misses.
pub struct QueryCache {
    entries: Mutex<LruCache<QueryKey, CachedResult>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            capacity,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached result for `key` computed under `generation`.
    ///
    /// Expired entries and entries from another generation are removed and count as
    /// misses.
    pub fn get(&self, key: &QueryKey, generation: u64) -> Option<RetrievalResult> {
        if self.capacity == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut entries = self.entries.lock();
        let stale = match entries.peek(key) {
            Some(cached) => {
                cached.generation != generation
                    || self.ttl.is_some_and(|ttl| cached.stored_at.elapsed() > ttl)
            }
            None => false,
        };
        if stale {
            entries.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match entries.get(key) {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached.result.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `result`, computed from reads that began at `generation`.
    pub fn put(&self, key: QueryKey, generation: u64, result: RetrievalResult) {
        if self.capacity == 0 {
            return;
        }
        self.entries.lock().put(
            key,
            CachedResult {
                result,
                generation,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every entry. Called after any write to a store.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            tracing::debug!(entries = entries.len(), "query cache invalidated");
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
        }
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}
