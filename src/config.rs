use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrataConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub pool_max_connections: usize,
    pub pool_acquire_timeout_ms: u64,
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"hash"` (built-in deterministic provider) or `"none"`. Hosts that inject their
    /// own provider ignore this field.
    pub provider: String,
    pub dimensions: usize,
    pub embedding_cache_size: usize,
    /// Return a fixed vector without calling any provider.
    pub mock: bool,
    pub timeout_ms: u64,
    /// Timed provider calls allowed to run at once. Further misses fail fast while
    /// this many calls are still outstanding.
    pub max_pending_calls: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub confidence_threshold: f64,
    pub min_retrieval_score: f64,
    pub top_k: usize,
    pub query_cache_size: usize,
    /// 0 disables expiry.
    pub query_cache_ttl_secs: u64,
    pub expansion_enabled: bool,
    pub max_expansions: usize,
    /// Root that chunk `source_path`s are resolved against. Unset skips citation checks.
    pub project_root: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_strata_dir().to_string_lossy().into_owned(),
            pool_max_connections: 4,
            pool_acquire_timeout_ms: 5000,
            pool_idle_timeout_secs: 300,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            dimensions: 384,
            embedding_cache_size: 10_000,
            mock: false,
            timeout_ms: 30_000,
            max_pending_calls: 4,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_retrieval_score: 0.3,
            top_k: 5,
            query_cache_size: 256,
            query_cache_ttl_secs: 300,
            expansion_enabled: true,
            max_expansions: 3,
            project_root: None,
        }
    }
}

/// Returns `~/.strata/`
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (STRATA_DATA_DIR, STRATA_LOG_LEVEL,
    /// STRATA_EMBEDDING_MOCK, STRATA_PROJECT_ROOT).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("STRATA_EMBEDDING_MOCK") {
            self.embedding.mock = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("STRATA_PROJECT_ROOT") {
            self.retrieval.project_root = Some(val);
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.storage.pool_max_connections > 0,
            "storage.pool_max_connections must be at least 1"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be at least 1"
        );
        anyhow::ensure!(
            self.embedding.max_pending_calls > 0,
            "embedding.max_pending_calls must be at least 1"
        );
        anyhow::ensure!(
            self.chunking.chunk_size > 0,
            "chunking.chunk_size must be at least 1"
        );
        anyhow::ensure!(
            self.chunking.chunk_overlap < self.chunking.chunk_size,
            "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
            self.chunking.chunk_overlap,
            self.chunking.chunk_size
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retrieval.confidence_threshold),
            "retrieval.confidence_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            (-1.0..=1.0).contains(&self.retrieval.min_retrieval_score),
            "retrieval.min_retrieval_score must be within [-1, 1]"
        );
        Ok(())
    }

    /// Resolve the data directory, expanding `~` if needed.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn resolved_project_root(&self) -> Option<PathBuf> {
        self.retrieval.project_root.as_deref().map(expand_tilde)
    }
}

impl StorageConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl RetrievalConfig {
    pub fn query_cache_ttl(&self) -> Option<Duration> {
        (self.query_cache_ttl_secs > 0).then(|| Duration::from_secs(self.query_cache_ttl_secs))
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
