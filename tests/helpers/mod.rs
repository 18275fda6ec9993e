#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use strata::config::StrataConfig;
use strata::embedding::{EmbeddingProvider, HashEmbeddingProvider};
use strata::memory::types::{LessonType, NewEpisode};
use strata::MemoryEngine;
use tempfile::TempDir;

pub const TEST_DIMS: usize = 256;

/// Config rooted at `dir`, with small embeddings and no provider timeout thread.
pub fn test_config(dir: &Path) -> StrataConfig {
    let mut config = StrataConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.storage.pool_acquire_timeout_ms = 2000;
    config.embedding.dimensions = TEST_DIMS;
    config.embedding.timeout_ms = 0;
    config.retrieval.min_retrieval_score = 0.05;
    config
}

/// Open an engine in a fresh temp directory with the built-in hash provider.
pub fn test_engine() -> (TempDir, MemoryEngine) {
    let tmp = TempDir::new().unwrap();
    let engine = MemoryEngine::open(test_config(tmp.path())).unwrap();
    (tmp, engine)
}

/// Like [`test_engine`], with a hook to adjust the config first.
pub fn test_engine_with(adjust: impl FnOnce(&mut StrataConfig)) -> (TempDir, MemoryEngine) {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    adjust(&mut config);
    let engine = MemoryEngine::open(config).unwrap();
    (tmp, engine)
}

pub fn new_episode(project_id: &str, situation: &str, lesson: &str, quality: f64) -> NewEpisode {
    NewEpisode {
        project_id: project_id.into(),
        situation: situation.into(),
        action: "applied a fix".into(),
        outcome: "issue resolved".into(),
        lesson: lesson.into(),
        lesson_type: LessonType::Pattern,
        quality,
    }
}

/// Deterministic prose of exactly `len` bytes built from short words.
pub fn prose(len: usize) -> String {
    const WORDS: &[&str] = &[
        "storage", "router", "tier", "chunk", "vector", "lesson", "fact", "query", "index",
        "cache", "pool", "schema",
    ];
    let mut out = String::with_capacity(len + 16);
    let mut i = 0;
    while out.len() < len {
        out.push_str(WORDS[i % WORDS.len()]);
        out.push(' ');
        i += 1;
    }
    out.truncate(len);
    out
}

/// Hash provider that counts how often it is called.
pub struct CountingProvider {
    inner: HashEmbeddingProvider,
    calls: AtomicUsize,
}

impl CountingProvider {
    pub fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbeddingProvider::new(dimensions),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for CountingProvider {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts.iter().map(|t| self.inner.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Hash provider that can be armed to park its next batch until released.
pub struct GatedProvider {
    inner: HashEmbeddingProvider,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl GatedProvider {
    pub fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbeddingProvider::new(dimensions),
            gate: Mutex::new(None),
        })
    }

    /// Park the next `embed_batch` call. Returns a receiver that fires once the call
    /// is parked and a sender that lets it continue.
    pub fn arm(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

impl EmbeddingProvider for GatedProvider {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        texts.iter().map(|t| self.inner.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        "gated"
    }
}
