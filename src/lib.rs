//! Three-tier knowledge memory for AI agents.
//!
//! Strata stores what an agent knows in three tiers with a fixed authority order and
//! answers queries by walking them top-down, stopping at the first confident answer:
//!
//! | Tier | Holds | Confidence | Authority |
//! |------|-------|------------|-----------|
//! | **Symbolic** | Key/value facts, one per `(scope, key)` | Always 1.0 | Highest |
//! | **Episodic** | Situation/action/outcome lessons | Quality in `[0, 1]`, advisory | Middle |
//! | **Semantic** | Embedded chunks of ingested documents | Cosine similarity | Lowest |
//!
//! # Architecture
//!
//! - **Storage**: one SQLite database per tier behind a bounded LIFO connection pool,
//!   FTS5 for fact and lesson matching, [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for cosine similarity over chunk embeddings
//! - **Embeddings**: injected [`embedding::EmbeddingProvider`] behind a blake3-keyed LRU
//!   cache; a deterministic hashing provider is built in
//! - **Routing**: [`retrieval::Orchestrator`] runs the tier walk as an explicit state
//!   machine, with query expansion, citation checks, and a result cache
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — Connection setup, the connection pool, and per-tier schema
//! - [`embedding`] — Provider trait, built-in providers, and the embedding cache
//! - [`memory`] — The three stores, record types, and the chunker
//! - [`retrieval`] — Query expansion, result cache, citation checks, and the router
//! - [`registry`] — Path-keyed store registry
//! - [`engine`] — [`MemoryEngine`] facade wiring everything from one config

pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod registry;
pub mod retrieval;
pub mod telemetry;

pub use engine::{EngineStats, MemoryEngine};
pub use error::{MemoryError, MemoryResult};
