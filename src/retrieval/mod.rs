//! Query-side components: expansion, result caching, citation checks, and the
//! confidence router that ties the three tiers together.

pub mod citation;
pub mod expander;
pub mod query_cache;
pub mod router;

use serde::Serialize;

use crate::memory::types::{Episode, Fact, ScoredChunk};

pub use citation::CitationValidator;
pub use expander::{QueryExpander, QueryType};
pub use query_cache::{QueryCache, QueryCacheStats, QueryKey};
pub use router::{Orchestrator, RouterSettings};

/// A memory tier, in authority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Symbolic,
    Episodic,
    Semantic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symbolic => "symbolic",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record behind a retrieved item.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum ItemPayload {
    Fact(Fact),
    Episode(Episode),
    Chunk(ScoredChunk),
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedItem {
    pub tier: Tier,
    /// Ranking score within the tier: 1.0 for facts, quality for episodes, cosine
    /// similarity for chunks.
    pub score: f64,
    pub confidence: f64,
    /// Offered as a suggestion, never as ground truth.
    pub advisory: bool,
    /// Whether a chunk's `source_path` still exists. `None` when not checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_valid: Option<bool>,
    pub payload: ItemPayload,
}

impl RetrievedItem {
    pub fn fact(fact: Fact) -> Self {
        Self {
            tier: Tier::Symbolic,
            score: 1.0,
            confidence: fact.confidence,
            advisory: false,
            citation_valid: None,
            payload: ItemPayload::Fact(fact),
        }
    }

    pub fn episode(episode: Episode) -> Self {
        Self {
            tier: Tier::Episodic,
            score: episode.quality,
            confidence: episode.quality,
            advisory: true,
            citation_valid: None,
            payload: ItemPayload::Episode(episode),
        }
    }

    pub fn chunk(scored: ScoredChunk, citation_valid: Option<bool>) -> Self {
        Self {
            tier: Tier::Semantic,
            score: scored.score,
            confidence: scored.score,
            advisory: citation_valid == Some(false),
            citation_valid,
            payload: ItemPayload::Chunk(scored),
        }
    }

    pub fn as_fact(&self) -> Option<&Fact> {
        match &self.payload {
            ItemPayload::Fact(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_episode(&self) -> Option<&Episode> {
        match &self.payload {
            ItemPayload::Episode(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_chunk(&self) -> Option<&ScoredChunk> {
        match &self.payload {
            ItemPayload::Chunk(c) => Some(c),
            _ => None,
        }
    }
}

/// Outcome of one routed query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub project_id: String,
    /// The tier that answered. Always exactly one entry.
    pub tiers_accessed: Vec<Tier>,
    /// Every tier consulted on the way, in order.
    pub tiers_checked: Vec<Tier>,
    pub items: Vec<RetrievedItem>,
    /// Estimated tokens avoided by not consulting the remaining tiers.
    pub tokens_saved: usize,
    /// Query variants searched in the semantic tier, original first.
    pub expansions: Vec<String>,
    pub from_cache: bool,
}

impl RetrievalResult {
    pub fn answered_by(&self) -> Option<Tier> {
        self.tiers_accessed.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
