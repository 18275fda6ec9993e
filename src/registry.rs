//! Explicit map from resolved database path to open store.
//!
//! Every caller that wants a store for a path goes through the registry, so one file
//! is backed by exactly one pool and two different paths can never alias the same
//! store instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ChunkingConfig;
use crate::db::{ensure_parent_dir, PoolSettings};
use crate::embedding::EmbeddingCache;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::episodic::EpisodicStore;
use crate::memory::semantic::SemanticStore;
use crate::memory::symbolic::SymbolicStore;

pub struct StoreRegistry {
    settings: PoolSettings,
    embeddings: Arc<EmbeddingCache>,
    chunking: ChunkingConfig,
    symbolic: Mutex<HashMap<PathBuf, Arc<SymbolicStore>>>,
    episodic: Mutex<HashMap<PathBuf, Arc<EpisodicStore>>>,
    semantic: Mutex<HashMap<PathBuf, Arc<SemanticStore>>>,
}

impl StoreRegistry {
    pub fn new(
        settings: PoolSettings,
        embeddings: Arc<EmbeddingCache>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            settings,
            embeddings,
            chunking,
            symbolic: Mutex::new(HashMap::new()),
            episodic: Mutex::new(HashMap::new()),
            semantic: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_symbolic(&self, path: impl AsRef<Path>) -> MemoryResult<Arc<SymbolicStore>> {
        let path = resolve(path.as_ref())?;
        let mut stores = self.symbolic.lock();
        if let Some(store) = stores.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SymbolicStore::open(&path, self.settings.clone())?);
        stores.insert(path, Arc::clone(&store));
        Ok(store)
    }

    pub fn open_episodic(&self, path: impl AsRef<Path>) -> MemoryResult<Arc<EpisodicStore>> {
        let path = resolve(path.as_ref())?;
        let mut stores = self.episodic.lock();
        if let Some(store) = stores.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(EpisodicStore::open(&path, self.settings.clone())?);
        stores.insert(path, Arc::clone(&store));
        Ok(store)
    }

    pub fn open_semantic(&self, path: impl AsRef<Path>) -> MemoryResult<Arc<SemanticStore>> {
        let path = resolve(path.as_ref())?;
        let mut stores = self.semantic.lock();
        if let Some(store) = stores.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SemanticStore::open(
            &path,
            self.settings.clone(),
            Arc::clone(&self.embeddings),
            self.chunking.clone(),
        )?);
        stores.insert(path, Arc::clone(&store));
        Ok(store)
    }

    /// Number of open stores across all tiers.
    pub fn len(&self) -> usize {
        self.symbolic.lock().len() + self.episodic.lock().len() + self.semantic.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every pool and forget every store.
    ///
    /// Handles still held by callers fail with `PoolClosed` afterwards.
    pub fn close_all(&self) {
        let mut closed = 0;
        for (_, store) in self.symbolic.lock().drain() {
            store.close();
            closed += 1;
        }
        for (_, store) in self.episodic.lock().drain() {
            store.close();
            closed += 1;
        }
        for (_, store) in self.semantic.lock().drain() {
            store.close();
            closed += 1;
        }
        tracing::info!(stores = closed, "store registry closed");
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.len())
            .finish()
    }
}

/// Canonical form of a database path whose file may not exist yet.
fn resolve(path: &Path) -> MemoryResult<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| MemoryError::validation(format!("`{}` is not a file path", path.display())))?;
    ensure_parent_dir(path)?;
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    let parent = std::fs::canonicalize(parent).map_err(|source| MemoryError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    Ok(parent.join(file_name))
}
