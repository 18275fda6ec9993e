//! Confidence router over the three tiers.
//!
//! Tiers are consulted strictly in authority order and the walk stops at the first
//! tier that answers:
//!
//! ```text
//! Start ──fact found──────────────────────────────────▶ Answered(symbolic)
//!   │ none
//! SymbolicChecked ──episode with quality ≥ threshold──▶ Answered(episodic)
//!   │ none
//! EpisodicChecked ──expand, embed, search─────────────▶ SemanticChecked
//!                                                       │ always
//!                                                       ▶ Answered(semantic)
//! ```
//!
//! Lower tiers are never touched once a higher one answers.
//!
//! Results are cached under the combined write generation of the three stores, read
//! before the walk starts. A write that lands mid-walk makes the stored result
//! unreachable instead of letting it shadow the new data.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::episodic::EpisodicStore;
use crate::memory::semantic::SemanticStore;
use crate::memory::symbolic::SymbolicStore;
use crate::memory::types::{EpisodeFilter, ScoredChunk};

use super::{
    CitationValidator, QueryCache, QueryExpander, QueryKey, RetrievalResult, RetrievedItem, Tier,
};

/// Assumed token cost of one episode, used to estimate savings when the episodic
/// tier is skipped.
const EPISODE_TOKEN_ESTIMATE: usize = 150;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub top_k: usize,
    pub min_retrieval_score: f64,
    pub max_expansions: usize,
    /// Configured chunk size in bytes, used to estimate skipped semantic results.
    pub chunk_size: usize,
}

impl From<&crate::config::StrataConfig> for RouterSettings {
    fn from(config: &crate::config::StrataConfig) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            min_retrieval_score: config.retrieval.min_retrieval_score,
            max_expansions: config.retrieval.max_expansions,
            chunk_size: config.chunking.chunk_size,
        }
    }
}

#[derive(Debug)]
enum RouteState {
    Start,
    SymbolicChecked,
    EpisodicChecked,
    SemanticChecked(Vec<RetrievedItem>),
    Answered { tier: Tier, items: Vec<RetrievedItem> },
}

/// Per-project router. Cheap to clone; all stores and caches are shared.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    project_id: String,
    symbolic: Arc<SymbolicStore>,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    expander: Arc<QueryExpander>,
    query_cache: Arc<QueryCache>,
    citations: CitationValidator,
    settings: RouterSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        symbolic: Arc<SymbolicStore>,
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticStore>,
        expander: Arc<QueryExpander>,
        query_cache: Arc<QueryCache>,
        citations: CitationValidator,
        settings: RouterSettings,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            symbolic,
            episodic,
            semantic,
            expander,
            query_cache,
            citations,
            settings,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Route `query` using the configured `top_k`.
    pub fn retrieve(&self, query: &str, min_confidence: f64) -> MemoryResult<RetrievalResult> {
        self.retrieve_top_k(query, min_confidence, self.settings.top_k)
    }

    pub fn retrieve_top_k(
        &self,
        query: &str,
        min_confidence: f64,
        top_k: usize,
    ) -> MemoryResult<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(MemoryError::validation("query must not be empty"));
        }
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(MemoryError::validation(format!(
                "min_confidence must be within [0, 1], got {min_confidence}"
            )));
        }

        let key = QueryKey::new(&self.project_id, query, top_k, min_confidence);
        let generation = self.write_generation();
        if let Some(mut cached) = self.query_cache.get(&key, generation) {
            tracing::debug!(project_id = %self.project_id, query, "query served from cache");
            cached.from_cache = true;
            return Ok(cached);
        }

        let mut checked: Vec<Tier> = Vec::new();
        let mut expansions: Vec<String> = Vec::new();
        let mut state = RouteState::Start;
        let (tier, items) = loop {
            state = match state {
                RouteState::Start => {
                    checked.push(Tier::Symbolic);
                    let facts = self.symbolic.search(query, top_k)?;
                    if facts.is_empty() {
                        RouteState::SymbolicChecked
                    } else {
                        RouteState::Answered {
                            tier: Tier::Symbolic,
                            items: facts.into_iter().map(RetrievedItem::fact).collect(),
                        }
                    }
                }
                RouteState::SymbolicChecked => {
                    checked.push(Tier::Episodic);
                    let episodes = self.episodic.query(&EpisodeFilter {
                        project_id: self.project_id.clone(),
                        lesson_type: None,
                        quality_min: Some(min_confidence),
                        text: Some(query.to_string()),
                        limit: Some(top_k),
                    })?;
                    if episodes.is_empty() {
                        RouteState::EpisodicChecked
                    } else {
                        RouteState::Answered {
                            tier: Tier::Episodic,
                            items: episodes.into_iter().map(RetrievedItem::episode).collect(),
                        }
                    }
                }
                RouteState::EpisodicChecked => {
                    checked.push(Tier::Semantic);
                    let (items, variants) = self.semantic_step(query, top_k)?;
                    expansions = variants;
                    RouteState::SemanticChecked(items)
                }
                RouteState::SemanticChecked(items) => RouteState::Answered {
                    tier: Tier::Semantic,
                    items,
                },
                RouteState::Answered { tier, items } => break (tier, items),
            };
        };

        let tokens_saved = self.tokens_saved(tier, top_k);
        tracing::debug!(
            project_id = %self.project_id,
            query,
            tier = %tier,
            items = items.len(),
            tokens_saved,
            "query routed"
        );

        let result = RetrievalResult {
            query: query.to_string(),
            project_id: self.project_id.clone(),
            tiers_accessed: vec![tier],
            tiers_checked: checked,
            items,
            tokens_saved,
            expansions,
            from_cache: false,
        };
        self.query_cache.put(key, generation, result.clone());
        Ok(result)
    }

    /// Sum of the stores' write generations; grows on every write to any tier.
    fn write_generation(&self) -> u64 {
        self.symbolic.pool().write_generation()
            + self.episodic.pool().write_generation()
            + self.semantic.pool().write_generation()
    }

    /// Expand, embed every variant in one batch, search each, and merge by chunk id.
    fn semantic_step(&self, query: &str, top_k: usize) -> MemoryResult<(Vec<RetrievedItem>, Vec<String>)> {
        if self.semantic.count_chunks(&self.project_id)? == 0 {
            return Ok((Vec::new(), vec![query.to_string()]));
        }

        let variants = self.expander.expand(query, self.settings.max_expansions);
        let texts: Vec<&str> = variants.iter().map(String::as_str).collect();
        let vectors = self.semantic.embeddings().embed_batch(&texts)?;

        // chunk id -> (best hit, index of the variant that found it)
        let mut best: HashMap<String, (ScoredChunk, usize)> = HashMap::new();
        for (variant, vector) in vectors.iter().enumerate() {
            let hits = self.semantic.search(
                &self.project_id,
                vector,
                top_k,
                self.settings.min_retrieval_score,
            )?;
            for hit in hits {
                match best.get(&hit.chunk.id) {
                    Some((existing, _)) if existing.score >= hit.score => {}
                    _ => {
                        best.insert(hit.chunk.id.clone(), (hit, variant));
                    }
                }
            }
        }

        let mut merged: Vec<(ScoredChunk, usize)> = best.into_values().collect();
        merged.sort_by(|(a, _), (b, _)| {
            b.score
                .total_cmp(&a.score)
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
                .then_with(|| a.chunk.source_path.cmp(&b.chunk.source_path))
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        merged.truncate(top_k);

        let mut useful: Vec<String> = Vec::new();
        for (_, variant) in &merged {
            if *variant > 0 && !useful.contains(&variants[*variant]) {
                useful.push(variants[*variant].clone());
            }
        }
        if !useful.is_empty() {
            self.expander.record_feedback(query, &useful);
        }

        let items = merged
            .into_iter()
            .map(|(hit, _)| {
                let citation_valid = self.citations.check(&hit.chunk.source_path);
                RetrievedItem::chunk(hit, citation_valid)
            })
            .collect();
        Ok((items, variants))
    }

    /// Estimated tokens of the tiers below `tier` that were never consulted.
    fn tokens_saved(&self, tier: Tier, top_k: usize) -> usize {
        let episodic = top_k * EPISODE_TOKEN_ESTIMATE;
        let semantic = top_k * self.settings.chunk_size.div_ceil(4);
        match tier {
            Tier::Symbolic => episodic + semantic,
            Tier::Episodic => semantic,
            Tier::Semantic => 0,
        }
    }
}
