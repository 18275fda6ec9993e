//! Typed failures surfaced by every store, cache, and the router.
//!
//! Validation and not-found errors are the caller's fault and never retried.
//! [`MemoryError::PoolExhausted`] is transient; retry policy belongs to the caller.

use std::path::PathBuf;

/// Convenience alias used across the crate.
pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Malformed input to a write or search operation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lookup by id found nothing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Every connection stayed leased until the acquire deadline passed.
    #[error("connection pool exhausted: {max_connections} connections in use after waiting {waited_ms}ms")]
    PoolExhausted { max_connections: usize, waited_ms: u64 },

    /// The pool was shut down with `close_all`.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The injected embedding capability failed, timed out, or is not configured.
    #[error("embedding capability unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// An SQLite statement failed.
    #[error("storage operation `{operation}` failed: {source}")]
    StorageIo {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A filesystem operation on a storage path failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl MemoryError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether the caller may reasonably retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

/// Attach the failing operation to an SQLite error and log it.
pub(crate) trait StorageContext<T> {
    fn storage(self, operation: &'static str) -> MemoryResult<T>;
}

impl<T> StorageContext<T> for Result<T, rusqlite::Error> {
    fn storage(self, operation: &'static str) -> MemoryResult<T> {
        self.map_err(|source| {
            tracing::error!(operation, error = %source, "storage operation failed");
            MemoryError::StorageIo { operation, source }
        })
    }
}
