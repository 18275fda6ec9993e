//! Content-hash keyed embedding cache in front of the injected provider.
//!
//! Keys are blake3 hashes of the text. Values are vectors. The LRU sits behind one
//! `parking_lot::Mutex`; provider calls always run outside it, so two threads missing
//! on the same text may both compute it and the last insert wins.
//!
//! With a timeout configured, provider calls run on worker threads. At most
//! `max_pending_calls` of them are outstanding at once; a worker that finishes after
//! its caller gave up still stores its vectors, so a retry hits the cache.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::{MemoryError, MemoryResult};

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    /// Number of calls that reached the provider (one per batch of misses).
    pub provider_calls: u64,
    /// Timed provider calls still running, including ones whose caller timed out.
    pub pending_calls: usize,
}

type Entries = Arc<Mutex<LruCache<blake3::Hash, Vec<f32>>>>;

pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    entries: Entries,
    capacity: usize,
    dimensions: usize,
    mock: bool,
    timeout: Option<Duration>,
    max_pending: usize,
    pending: Arc<AtomicUsize>,
    hits: AtomicU64,
    misses: AtomicU64,
    provider_calls: AtomicU64,
}

/// Decrements the pending-call counter when a worker finishes, even by panic.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        let capacity = config.embedding_cache_size.max(1);
        let dimensions = provider.dimensions();
        if dimensions != config.dimensions {
            tracing::warn!(
                provider = provider.name(),
                provider_dimensions = dimensions,
                configured = config.dimensions,
                "provider dimensions differ from config, using the provider's"
            );
        }
        Self {
            provider,
            entries: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            ))),
            capacity,
            dimensions,
            mock: config.mock,
            timeout: config.timeout(),
            max_pending: config.max_pending_calls.max(1),
            pending: Arc::new(AtomicUsize::new(0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    /// Embed one text, consulting the cache first.
    pub fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::EmbeddingUnavailable("provider returned no vector".into()))
    }

    /// Embed many texts. Cache misses go to the provider in a single batch call.
    ///
    /// Output order matches `texts`. Duplicate texts within one batch are computed once.
    pub fn embed_batch(&self, texts: &[&str]) -> MemoryResult<Vec<Vec<f32>>> {
        if self.mock {
            return Ok(texts.iter().map(|_| mock_vector(self.dimensions)).collect());
        }

        let hashes: Vec<blake3::Hash> = texts.iter().map(|t| blake3::hash(t.as_bytes())).collect();
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut pending: Vec<(blake3::Hash, &str)> = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (hash, text) in hashes.iter().zip(texts) {
                match entries.get(hash) {
                    Some(vector) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        results.push(Some(vector.clone()));
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        if !pending.iter().any(|(h, _)| h == hash) {
                            pending.push((*hash, *text));
                        }
                        results.push(None);
                    }
                }
            }
        }

        if !pending.is_empty() {
            let batch: Vec<&str> = pending.iter().map(|(_, t)| *t).collect();
            let batch_hashes: Vec<blake3::Hash> = pending.iter().map(|(h, _)| *h).collect();
            let computed = self.call_provider(&batch, batch_hashes)?;

            let mut entries = self.entries.lock();
            for ((hash, _), vector) in pending.iter().zip(computed) {
                for (slot, h) in results.iter_mut().zip(&hashes) {
                    if slot.is_none() && h == hash {
                        *slot = Some(vector.clone());
                    }
                }
                entries.put(*hash, vector);
            }
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| MemoryError::EmbeddingUnavailable("missing vector for text".into()))
            })
            .collect()
    }

    fn call_provider(
        &self,
        batch: &[&str],
        hashes: Vec<blake3::Hash>,
    ) -> MemoryResult<Vec<Vec<f32>>> {
        let outcome = match self.timeout {
            None => {
                self.record_call(batch.len());
                self.provider.embed_batch(batch)
            }
            Some(timeout) => self.call_with_timeout(batch, hashes, timeout)?,
        };
        let vectors = outcome.map_err(|e| {
            tracing::warn!(provider = self.provider.name(), error = %e, "embedding provider failed");
            MemoryError::EmbeddingUnavailable(format!("{e:#}"))
        })?;
        check_vectors(&vectors, batch.len(), self.dimensions)?;
        Ok(vectors)
    }

    fn record_call(&self, count: usize) {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            provider = self.provider.name(),
            count,
            "embedding cache misses sent to provider"
        );
    }

    /// Run the provider on a worker thread and wait at most `timeout` for it.
    fn call_with_timeout(
        &self,
        batch: &[&str],
        hashes: Vec<blake3::Hash>,
        timeout: Duration,
    ) -> MemoryResult<anyhow::Result<Vec<Vec<f32>>>> {
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_pending).then_some(n + 1)
            });
        if let Err(outstanding) = reserved {
            tracing::warn!(
                provider = self.provider.name(),
                outstanding,
                "embedding provider saturated, failing fast"
            );
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "provider `{}` has {outstanding} calls still outstanding",
                self.provider.name()
            )));
        }
        let guard = PendingGuard(Arc::clone(&self.pending));
        self.record_call(batch.len());

        let provider = Arc::clone(&self.provider);
        let entries = Arc::clone(&self.entries);
        let dimensions = self.dimensions;
        let owned: Vec<String> = batch.iter().map(|t| t.to_string()).collect();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _guard = guard;
            let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
            let outcome = provider.embed_batch(&refs);
            if let Err(mpsc::SendError(late)) = tx.send(outcome) {
                // caller already gave up; keep the work for the next attempt
                if let Ok(vectors) = late {
                    if check_vectors(&vectors, hashes.len(), dimensions).is_ok() {
                        let mut entries = entries.lock();
                        for (hash, vector) in hashes.into_iter().zip(vectors) {
                            entries.put(hash, vector);
                        }
                    }
                }
            }
        });

        match rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "embedding call timed out"
                );
                Err(MemoryError::EmbeddingUnavailable(format!(
                    "provider `{}` timed out after {}ms",
                    self.provider.name(),
                    timeout.as_millis()
                )))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(MemoryError::EmbeddingUnavailable(format!(
                    "provider `{}` aborted",
                    self.provider.name()
                )))
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
            capacity: self.capacity,
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            pending_calls: self.pending.load(Ordering::Acquire),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("provider", &self.provider.name())
            .field("mock", &self.mock)
            .field("stats", &self.stats())
            .finish()
    }
}

fn check_vectors(vectors: &[Vec<f32>], expected: usize, dimensions: usize) -> MemoryResult<()> {
    if vectors.len() != expected {
        return Err(MemoryError::EmbeddingUnavailable(format!(
            "provider returned {} vectors for {} texts",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(MemoryError::EmbeddingUnavailable(format!(
            "provider returned a {}-dimensional vector, expected {}",
            bad.len(),
            dimensions
        )));
    }
    Ok(())
}

/// Fixed unit vector returned in mock mode.
fn mock_vector(dimensions: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimensions];
    if let Some(first) = v.first_mut() {
        *first = 1.0;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashEmbeddingProvider, NoEmbeddingProvider};

    fn config(size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions: 16,
            embedding_cache_size: size,
            ..EmbeddingConfig::default()
        }
    }

    fn hash_cache(size: usize) -> EmbeddingCache {
        EmbeddingCache::new(Arc::new(HashEmbeddingProvider::new(16)), &config(size))
    }

    #[test]
    fn repeated_text_hits_cache() {
        let cache = hash_cache(8);
        let a = cache.embed("alpha").unwrap();
        let b = cache.embed("alpha").unwrap();
        assert_eq!(a, b);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.provider_calls, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn batch_sends_misses_in_one_call() {
        let cache = hash_cache(8);
        cache.embed("beta").unwrap();

        let vectors = cache.embed_batch(&["alpha", "beta", "gamma", "alpha"]).unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[0], vectors[3]);

        let stats = cache.stats();
        assert_eq!(stats.provider_calls, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn mock_mode_skips_provider() {
        let mut cfg = config(8);
        cfg.mock = true;
        let cache = EmbeddingCache::new(Arc::new(NoEmbeddingProvider::new(16)), &cfg);

        let v = cache.embed("anything").unwrap();
        assert_eq!(v.len(), 16);
        assert_eq!(v[0], 1.0);
        assert_eq!(cache.stats().provider_calls, 0);
    }

    #[test]
    fn provider_failure_is_embedding_unavailable() {
        let cache = EmbeddingCache::new(Arc::new(NoEmbeddingProvider::new(16)), &config(8));
        let err = cache.embed("anything").unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingUnavailable(_)));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        struct Short;
        impl EmbeddingProvider for Short {
            fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                Ok(vec![1.0; 3])
            }
            fn dimensions(&self) -> usize {
                4
            }
            fn name(&self) -> &str {
                "short"
            }
        }

        let cache = EmbeddingCache::new(Arc::new(Short), &config(8));
        assert!(matches!(
            cache.embed("x"),
            Err(MemoryError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn slow_provider_times_out() {
        struct Slow;
        impl EmbeddingProvider for Slow {
            fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(vec![1.0; 16])
            }
            fn dimensions(&self) -> usize {
                16
            }
            fn name(&self) -> &str {
                "slow"
            }
        }

        let mut cfg = config(8);
        cfg.timeout_ms = 20;
        let cache = EmbeddingCache::new(Arc::new(Slow), &cfg);
        let err = cache.embed("x").unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn stuck_provider_caps_outstanding_workers() {
        use parking_lot::Condvar;

        #[derive(Default)]
        struct Gated {
            open: parking_lot::Mutex<bool>,
            opened: Condvar,
            calls: AtomicUsize,
        }
        impl EmbeddingProvider for Gated {
            fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut open = self.open.lock();
                while !*open {
                    self.opened.wait(&mut open);
                }
                HashEmbeddingProvider::new(16).embed(text)
            }
            fn dimensions(&self) -> usize {
                16
            }
            fn name(&self) -> &str {
                "gated"
            }
        }

        let provider = Arc::new(Gated::default());
        let mut cfg = config(8);
        cfg.timeout_ms = 10;
        cfg.max_pending_calls = 2;
        let cache = EmbeddingCache::new(provider.clone(), &cfg);

        let errors: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|text| cache.embed(text).unwrap_err().to_string())
            .collect();
        assert!(errors[0].contains("timed out"));
        assert!(errors[1].contains("timed out"));
        assert!(errors[2..].iter().all(|e| e.contains("outstanding")));
        assert_eq!(cache.stats().pending_calls, 2);
        assert_eq!(cache.stats().provider_calls, 2);

        *provider.open.lock() = true;
        provider.opened.notify_all();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cache.stats().pending_calls > 0 {
            assert!(std::time::Instant::now() < deadline, "workers never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // the late result was kept, so a retry is a cache hit
        cache.embed("a").unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
