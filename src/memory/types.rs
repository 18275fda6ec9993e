//! Core record definitions for the three tiers.
//!
//! Defines [`Scope`] (fact visibility), [`LessonType`] (closed episode taxonomy),
//! [`Fact`], [`Episode`], [`Chunk`], and the filters each store accepts.

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Visibility scope for a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session,
    Project,
    User,
    Org,
}

impl Scope {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Project => "project",
            Self::User => "user",
            Self::Org => "org",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "project" => Ok(Self::Project),
            "user" => Ok(Self::User),
            "org" => Ok(Self::Org),
            _ => Err(MemoryError::validation(format!("unknown scope: {s}"))),
        }
    }
}

/// What kind of lesson an episode records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    Pattern,
    Mistake,
    Success,
    Failure,
    General,
}

impl LessonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Mistake => "mistake",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for LessonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LessonType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pattern" => Ok(Self::Pattern),
            "mistake" => Ok(Self::Mistake),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "general" => Ok(Self::General),
            _ => Err(MemoryError::validation(format!("unknown lesson type: {s}"))),
        }
    }
}

/// An authoritative fact, matching the `facts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// UUID v7 (time-sortable) primary key. Stable across updates.
    pub id: String,
    pub scope: Scope,
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
    /// Always 1.0.
    pub confidence: f64,
    pub source: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

/// Conjunctive filter for `SymbolicStore::query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct FactFilter {
    pub scope: Option<Scope>,
    pub category: Option<String>,
    pub confidence_min: Option<f64>,
}

/// An advisory lesson, matching the `episodes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub project_id: String,
    pub situation: String,
    pub action: String,
    pub outcome: String,
    pub lesson: String,
    pub lesson_type: LessonType,
    /// Advisory confidence in `[0.0, 1.0]`, used only for ranking.
    pub quality: f64,
    pub created_at: String,
}

/// Input to `EpisodicStore::add_episode`.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub project_id: String,
    pub situation: String,
    pub action: String,
    pub outcome: String,
    pub lesson: String,
    pub lesson_type: LessonType,
    pub quality: f64,
}

/// Filter for `EpisodicStore::query`.
#[derive(Debug, Clone, Default)]
pub struct EpisodeFilter {
    pub project_id: String,
    pub lesson_type: Option<LessonType>,
    pub quality_min: Option<f64>,
    /// Relevance match over situation, action, outcome, and lesson.
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl EpisodeFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }
}

/// A stored slice of a source document with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    pub source_path: String,
    /// Position within the source document, starting at 0.
    pub chunk_index: usize,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

/// A chunk with its cosine similarity to a query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// One ingested document and its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub project_id: String,
    pub source_path: String,
    /// blake3 over the raw text, the document metadata, and the chunk settings it was
    /// split with, hex encoded.
    pub content_hash: String,
    pub chunk_count: usize,
    /// Document-level metadata as passed to ingest.
    pub metadata: serde_json::Value,
    pub ingested_at: String,
}
