//! Text-to-vector embedding capability.
//!
//! The inference runtime is injected: hosts implement [`EmbeddingProvider`] (and
//! optionally [`TextGenerator`]) over whatever model they run. Two built-in providers
//! exist so the engine works without one: `"hash"`, a deterministic feature-hashing
//! bag-of-words, and `"none"`, which always fails. Every call goes through
//! [`EmbeddingCache`].

pub mod cache;

use anyhow::Result;

pub use cache::{CacheStats, EmbeddingCache};

/// Default number of dimensions in embedding vectors.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// All methods are synchronous. Callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn name(&self) -> &str;
}

/// Optional text-generation capability, used to phrase query expansions.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}

/// Create an embedding provider from config.
///
/// Supported: `"hash"` and `"none"`. Anything else is a host-injected provider and
/// must be passed to `MemoryEngine::with_provider` instead.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbeddingProvider::new(config.dimensions))),
        "none" => Ok(Box::new(NoEmbeddingProvider::new(config.dimensions))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: hash, none"),
    }
}

/// Deterministic feature-hashing provider.
///
/// Lowercased alphanumeric terms are hashed (FNV-1a) into fixed buckets weighted by
/// term frequency, then L2-normalized. Texts that share words get a positive cosine
/// similarity. Never returns a zero vector.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % dims as u64) as usize
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        let terms = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let mut any = false;
        for term in terms {
            vec[Self::bucket(&term, self.dimensions)] += 1.0;
            any = true;
        }
        if !any {
            // punctuation-only or empty text still needs a direction
            vec[Self::bucket(text, self.dimensions)] = 1.0;
        }

        l2_normalize(&mut vec);
        vec
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Provider used when no embedding capability is configured. Every call fails.
#[derive(Debug, Clone)]
pub struct NoEmbeddingProvider {
    dimensions: usize,
}

impl NoEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl EmbeddingProvider for NoEmbeddingProvider {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("no embedding provider configured")
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Scale `vec` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two equal-length vectors; 0.0 if either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_provider_is_deterministic_and_normalized() {
        let p = HashEmbeddingProvider::new(64);
        let a = p.embed("Connection pooling for SQLite").unwrap();
        let b = p.embed("Connection pooling for SQLite").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_provider_never_returns_zero_vector() {
        let p = HashEmbeddingProvider::new(32);
        for text in ["", "   ", "!!!"] {
            let v = p.embed(text).unwrap();
            assert!(v.iter().any(|&x| x != 0.0), "zero vector for {text:?}");
        }
    }

    #[test]
    fn shared_words_score_higher_than_disjoint_text() {
        let p = HashEmbeddingProvider::new(EMBEDDING_DIM);
        let doc = p.embed("the retry policy uses exponential backoff").unwrap();
        let related = p.embed("exponential backoff retry").unwrap();
        let unrelated = p.embed("purple giraffes dance").unwrap();

        assert!(cosine_similarity(&doc, &related) > cosine_similarity(&doc, &unrelated));
        assert!(cosine_similarity(&doc, &related) > 0.5);
    }

    #[test]
    fn none_provider_always_fails() {
        let p = NoEmbeddingProvider::new(8);
        assert!(p.embed("anything").is_err());
        assert!(p.embed_batch(&["a", "b"]).is_err());
        assert_eq!(p.dimensions(), 8);
    }

    #[test]
    fn create_provider_rejects_unknown_names() {
        let mut config = crate::config::EmbeddingConfig::default();
        assert_eq!(create_provider(&config).unwrap().name(), "hash");

        config.provider = "onnx".into();
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
