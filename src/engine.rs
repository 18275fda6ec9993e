//! One-stop facade wiring stores, caches, and the router from a [`StrataConfig`].
//!
//! Engine writes clear the query cache eagerly; the router also discards any cached
//! result older than the latest store write, so writes made straight on a store are
//! covered too. Reads go through per-project [`Orchestrator`]s. The engine is
//! synchronous; the `_async` wrappers move work onto tokio's blocking pool.

use std::sync::Arc;

use serde::Serialize;

use crate::config::StrataConfig;
use crate::db::{PoolSettings, PoolStats};
use crate::embedding::{create_provider, CacheStats, EmbeddingCache, EmbeddingProvider, TextGenerator};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::episodic::EpisodicStore;
use crate::memory::semantic::SemanticStore;
use crate::memory::symbolic::SymbolicStore;
use crate::memory::types::{Chunk, Episode, Fact, NewEpisode, Scope};
use crate::registry::StoreRegistry;
use crate::retrieval::{
    CitationValidator, Orchestrator, QueryCache, QueryCacheStats, QueryExpander, RetrievalResult,
    RouterSettings,
};

/// Database file names under `storage.data_dir`.
pub const SYMBOLIC_DB: &str = "symbolic.db";
pub const EPISODIC_DB: &str = "episodic.db";
pub const SEMANTIC_DB: &str = "semantic.db";

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub facts: u64,
    pub embedding_cache: CacheStats,
    pub query_cache: QueryCacheStats,
    pub expansions_computed: u64,
    pub symbolic_pool: PoolStats,
    pub episodic_pool: PoolStats,
    pub semantic_pool: PoolStats,
}

#[derive(Debug)]
pub struct MemoryEngine {
    config: StrataConfig,
    registry: StoreRegistry,
    symbolic: Arc<SymbolicStore>,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    embeddings: Arc<EmbeddingCache>,
    expander: Arc<QueryExpander>,
    query_cache: Arc<QueryCache>,
    citations: CitationValidator,
}

impl MemoryEngine {
    /// Open the engine with the embedding provider named in `config.embedding.provider`.
    pub fn open(config: StrataConfig) -> MemoryResult<Self> {
        let provider = create_provider(&config.embedding)
            .map_err(|e| MemoryError::validation(format!("{e:#}")))?;
        Self::with_provider(config, Arc::from(provider))
    }

    /// Open the engine with a host-supplied embedding provider.
    pub fn with_provider(
        config: StrataConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> MemoryResult<Self> {
        config
            .validate()
            .map_err(|e| MemoryError::validation(format!("{e:#}")))?;

        let data_dir = config.resolved_data_dir();
        let embeddings = Arc::new(EmbeddingCache::new(provider, &config.embedding));
        let registry = StoreRegistry::new(
            PoolSettings::from(&config.storage),
            Arc::clone(&embeddings),
            config.chunking.clone(),
        );
        let symbolic = registry.open_symbolic(data_dir.join(SYMBOLIC_DB))?;
        let episodic = registry.open_episodic(data_dir.join(EPISODIC_DB))?;
        let semantic = registry.open_semantic(data_dir.join(SEMANTIC_DB))?;

        let expander = Arc::new(QueryExpander::new(
            config.retrieval.expansion_enabled,
            config.retrieval.max_expansions,
        ));
        let query_cache = Arc::new(QueryCache::new(
            config.retrieval.query_cache_size,
            config.retrieval.query_cache_ttl(),
        ));
        let citations = CitationValidator::new(config.resolved_project_root());

        tracing::info!(
            data_dir = %data_dir.display(),
            provider = embeddings.provider_name(),
            mock = embeddings.is_mock(),
            "memory engine opened"
        );

        Ok(Self {
            config,
            registry,
            symbolic,
            episodic,
            semantic,
            embeddings,
            expander,
            query_cache,
            citations,
        })
    }

    /// Use `generator` to phrase query expansions.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.expander = Arc::new(
            QueryExpander::new(
                self.config.retrieval.expansion_enabled,
                self.config.retrieval.max_expansions,
            )
            .with_generator(generator),
        );
        self
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn symbolic(&self) -> &Arc<SymbolicStore> {
        &self.symbolic
    }

    pub fn episodic(&self) -> &Arc<EpisodicStore> {
        &self.episodic
    }

    pub fn semantic(&self) -> &Arc<SemanticStore> {
        &self.semantic
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingCache> {
        &self.embeddings
    }

    pub fn expander(&self) -> &Arc<QueryExpander> {
        &self.expander
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    pub fn put_fact(
        &self,
        scope: Scope,
        key: &str,
        value: serde_json::Value,
        category: Option<&str>,
        source: Option<&str>,
    ) -> MemoryResult<Fact> {
        let fact = self.symbolic.put_fact(scope, key, value, category, source)?;
        self.query_cache.invalidate_all();
        Ok(fact)
    }

    pub fn delete_fact(&self, id: &str) -> MemoryResult<()> {
        self.symbolic.delete(id)?;
        self.query_cache.invalidate_all();
        Ok(())
    }

    pub fn add_episode(&self, episode: NewEpisode) -> MemoryResult<Episode> {
        let episode = self.episodic.add_episode(episode)?;
        self.query_cache.invalidate_all();
        Ok(episode)
    }

    pub fn delete_episode(&self, id: &str) -> MemoryResult<()> {
        self.episodic.delete(id)?;
        self.query_cache.invalidate_all();
        Ok(())
    }

    pub fn ingest_document(
        &self,
        project_id: &str,
        source_path: &str,
        raw_text: &str,
        metadata: serde_json::Value,
    ) -> MemoryResult<Vec<Chunk>> {
        let chunks = self
            .semantic
            .ingest_document(project_id, source_path, raw_text, metadata)?;
        self.query_cache.invalidate_all();
        Ok(chunks)
    }

    pub fn delete_document(&self, project_id: &str, source_path: &str) -> MemoryResult<usize> {
        let removed = self.semantic.delete_document(project_id, source_path)?;
        self.query_cache.invalidate_all();
        Ok(removed)
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// A router scoped to `project_id`, sharing this engine's stores and caches.
    pub fn orchestrator(&self, project_id: &str) -> Orchestrator {
        Orchestrator::new(
            project_id,
            Arc::clone(&self.symbolic),
            Arc::clone(&self.episodic),
            Arc::clone(&self.semantic),
            Arc::clone(&self.expander),
            Arc::clone(&self.query_cache),
            self.citations.clone(),
            RouterSettings::from(&self.config),
        )
    }

    pub fn retrieve(
        &self,
        project_id: &str,
        query: &str,
        min_confidence: f64,
    ) -> MemoryResult<RetrievalResult> {
        self.orchestrator(project_id).retrieve(query, min_confidence)
    }

    /// Retrieve with the configured `confidence_threshold`.
    pub fn retrieve_default(&self, project_id: &str, query: &str) -> MemoryResult<RetrievalResult> {
        self.retrieve(project_id, query, self.config.retrieval.confidence_threshold)
    }

    // ── Async wrappers ────────────────────────────────────────────────────────

    pub async fn retrieve_async(
        self: &Arc<Self>,
        project_id: String,
        query: String,
        min_confidence: f64,
    ) -> MemoryResult<RetrievalResult> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.retrieve(&project_id, &query, min_confidence))
            .await
            .map_err(|e| MemoryError::Task(e.to_string()))?
    }

    pub async fn ingest_document_async(
        self: &Arc<Self>,
        project_id: String,
        source_path: String,
        raw_text: String,
        metadata: serde_json::Value,
    ) -> MemoryResult<Vec<Chunk>> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            engine.ingest_document(&project_id, &source_path, &raw_text, metadata)
        })
        .await
        .map_err(|e| MemoryError::Task(e.to_string()))?
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn stats(&self) -> MemoryResult<EngineStats> {
        Ok(EngineStats {
            facts: self.symbolic.count()?,
            embedding_cache: self.embeddings.stats(),
            query_cache: self.query_cache.stats(),
            expansions_computed: self.expander.computed(),
            symbolic_pool: self.symbolic.pool_stats(),
            episodic_pool: self.episodic.pool_stats(),
            semantic_pool: self.semantic.pool_stats(),
        })
    }

    /// Close every connection. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.query_cache.invalidate_all();
        self.registry.close_all();
        tracing::info!("memory engine closed");
    }
}
