//! Semantic tier: embedded document chunks and similarity search.
//!
//! A document's chunks are written, replaced, and deleted as one unit inside a single
//! `BEGIN IMMEDIATE` transaction; readers never see a mix of old and new chunks.
//! Similarity is cosine, computed by sqlite-vec's `vec_distance_cosine` over the stored
//! little-endian f32 blobs.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::config::ChunkingConfig;
use crate::db::schema::{get_meta, init_schema, set_meta, TierSchema};
use crate::db::{ConnectionPool, PoolSettings, PoolStats};
use crate::embedding::EmbeddingCache;
use crate::error::{MemoryError, MemoryResult, StorageContext};
use crate::memory::chunker::{chunk_code, chunk_spans, TextChunk};
use crate::memory::types::{Chunk, DocumentInfo, ScoredChunk};
use crate::memory::{embedding_from_bytes, embedding_to_bytes, now_timestamp, write_audit_log};

const CHUNK_COLUMNS: &str =
    "id, project_id, source_path, chunk_index, content, embedding, metadata, created_at";

/// File extensions routed through the code-aware chunker.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h", "cc", "cpp", "hpp",
    "cs", "rb", "swift", "scala", "php",
];

struct ChunkRow {
    chunk: Chunk,
    metadata: Option<String>,
}

impl ChunkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let embedding: Vec<u8> = row.get(5)?;
        Ok(Self {
            chunk: Chunk {
                id: row.get(0)?,
                project_id: row.get(1)?,
                source_path: row.get(2)?,
                chunk_index: row.get::<_, i64>(3)? as usize,
                content: row.get(4)?,
                embedding: embedding_from_bytes(&embedding),
                metadata: serde_json::Value::Null,
                created_at: row.get(7)?,
            },
            metadata: row.get(6)?,
        })
    }

    fn into_chunk(self) -> MemoryResult<Chunk> {
        let mut chunk = self.chunk;
        chunk.metadata = match self.metadata {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::json!({}),
        };
        Ok(chunk)
    }
}

#[derive(Debug, Clone)]
pub struct SemanticStore {
    pool: ConnectionPool,
    embeddings: Arc<EmbeddingCache>,
    chunking: ChunkingConfig,
    dimensions: usize,
}

impl SemanticStore {
    /// Open (or create) the semantic database at `path`.
    ///
    /// The first open records the embedding dimension; reopening with a cache of a
    /// different dimension is a validation error.
    pub fn open(
        path: impl AsRef<Path>,
        settings: PoolSettings,
        embeddings: Arc<EmbeddingCache>,
        chunking: ChunkingConfig,
    ) -> MemoryResult<Self> {
        let dimensions = embeddings.dimensions();
        let pool = ConnectionPool::open(path, settings)?;
        pool.write(|conn| {
            init_schema(conn, TierSchema::Semantic)?;
            match get_meta(conn, "embedding_dim")? {
                Some(stored) if stored != dimensions.to_string() => {
                    Err(MemoryError::validation(format!(
                        "semantic store holds {stored}-dimensional embeddings, provider produces {dimensions}"
                    )))
                }
                Some(_) => Ok(()),
                None => set_meta(conn, "embedding_dim", &dimensions.to_string()),
            }
        })?;
        tracing::info!(path = %pool.path().display(), dimensions, "semantic store opened");
        Ok(Self {
            pool,
            embeddings,
            chunking,
            dimensions,
        })
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingCache> {
        &self.embeddings
    }

    /// Chunk, embed, and store a document, replacing any earlier version.
    ///
    /// A re-ingest with the same text, metadata, and chunk settings returns the stored
    /// chunks without embedding. Changing any of them replaces the document.
    /// `metadata` must be a JSON object or null; each chunk gets a copy plus its
    /// `chunk_kind`, `byte_start`, and `byte_end`.
    pub fn ingest_document(
        &self,
        project_id: &str,
        source_path: &str,
        raw_text: &str,
        metadata: serde_json::Value,
    ) -> MemoryResult<Vec<Chunk>> {
        if project_id.trim().is_empty() || source_path.trim().is_empty() {
            return Err(MemoryError::validation(
                "project_id and source_path must not be empty",
            ));
        }
        if raw_text.trim().is_empty() {
            return Err(MemoryError::validation(format!(
                "document `{source_path}` has no content"
            )));
        }
        let base_metadata = match metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(MemoryError::validation(format!(
                    "document metadata must be an object, got {other}"
                )))
            }
        };

        let document_metadata = serde_json::Value::Object(base_metadata.clone()).to_string();
        let content_hash = self.ingest_hash(raw_text, &document_metadata);
        if let Some(existing) = self.document(project_id, source_path)? {
            if existing.content_hash == content_hash {
                tracing::debug!(project_id, source_path, "document unchanged, skipping ingest");
                return self.document_chunks(project_id, source_path);
            }
        }

        let pieces = self.split(source_path, raw_text);
        let texts: Vec<&str> = pieces.iter().map(|p| p.content.as_str()).collect();
        let vectors = self.embeddings.embed_batch(&texts)?;

        let now = now_timestamp();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (piece, embedding))| {
                let mut metadata = base_metadata.clone();
                metadata.insert("chunk_kind".into(), piece.kind.as_str().into());
                metadata.insert("byte_start".into(), piece.start.into());
                metadata.insert("byte_end".into(), piece.end.into());
                Chunk {
                    id: uuid::Uuid::now_v7().to_string(),
                    project_id: project_id.to_string(),
                    source_path: source_path.to_string(),
                    chunk_index: index,
                    content: piece.content,
                    embedding,
                    metadata: serde_json::Value::Object(metadata),
                    created_at: now.clone(),
                }
            })
            .collect();

        let replaced = self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin ingest_document")?;

            let replaced = count_document_chunks(&tx, project_id, source_path)?;
            // chunks follow via ON DELETE CASCADE
            tx.execute(
                "DELETE FROM documents WHERE project_id = ?1 AND source_path = ?2",
                params![project_id, source_path],
            )
            .storage("replace document")?;
            tx.execute(
                "INSERT INTO documents (project_id, source_path, content_hash, chunk_count, metadata, ingested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    source_path,
                    content_hash,
                    chunks.len() as i64,
                    document_metadata,
                    now
                ],
            )
            .storage("insert document")?;

            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO chunks (id, project_id, source_path, chunk_index, content, embedding, metadata, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .storage("prepare insert chunk")?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.id,
                        chunk.project_id,
                        chunk.source_path,
                        chunk.chunk_index as i64,
                        chunk.content,
                        embedding_to_bytes(&chunk.embedding),
                        chunk.metadata.to_string(),
                        chunk.created_at,
                    ])
                    .storage("insert chunk")?;
                }
            }

            write_audit_log(
                &tx,
                "ingest",
                &format!("{project_id}:{source_path}"),
                Some(&serde_json::json!({
                    "chunks": chunks.len(),
                    "replaced": replaced,
                    "content_hash": content_hash,
                })),
            )?;
            tx.commit().storage("commit ingest_document")?;
            Ok(replaced)
        })?;

        tracing::info!(
            project_id,
            source_path,
            chunks = chunks.len(),
            replaced,
            "document ingested"
        );
        Ok(chunks)
    }

    /// Remove a document and all of its chunks. Returns how many chunks were removed.
    pub fn delete_document(&self, project_id: &str, source_path: &str) -> MemoryResult<usize> {
        let removed = self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin delete_document")?;
            let removed = count_document_chunks(&tx, project_id, source_path)?;
            let documents = tx
                .execute(
                    "DELETE FROM documents WHERE project_id = ?1 AND source_path = ?2",
                    params![project_id, source_path],
                )
                .storage("delete_document")?;
            if documents > 0 {
                write_audit_log(
                    &tx,
                    "delete",
                    &format!("{project_id}:{source_path}"),
                    Some(&serde_json::json!({"chunks": removed})),
                )?;
            }
            tx.commit().storage("commit delete_document")?;
            Ok(removed)
        })?;
        tracing::debug!(project_id, source_path, removed, "document deleted");
        Ok(removed)
    }

    /// Chunks of `project_id` with cosine similarity at least `min_score`.
    ///
    /// At most `top_k`, best first; ties go to the earlier `chunk_index`, then
    /// `source_path`.
    pub fn search(
        &self,
        project_id: &str,
        query_embedding: &[f32],
        top_k: usize,
        min_score: f64,
    ) -> MemoryResult<Vec<ScoredChunk>> {
        if query_embedding.len() != self.dimensions {
            return Err(MemoryError::validation(format!(
                "query embedding has {} dimensions, store expects {}",
                query_embedding.len(),
                self.dimensions
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {CHUNK_COLUMNS}, score FROM ( \
                 SELECT {CHUNK_COLUMNS}, COALESCE(1.0 - vec_distance_cosine(embedding, ?1), 0.0) AS score \
                 FROM chunks WHERE project_id = ?2 \
             ) WHERE score >= ?3 \
             ORDER BY score DESC, chunk_index ASC, source_path ASC LIMIT ?4"
        );
        let query_bytes = embedding_to_bytes(query_embedding);

        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&sql).storage("prepare search_chunks")?;
            let rows = stmt
                .query_map(
                    params![query_bytes, project_id, min_score, top_k as i64],
                    |row| Ok((ChunkRow::from_row(row)?, row.get::<_, f64>(8)?)),
                )
                .storage("search_chunks")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read chunks")?;
            rows.into_iter()
                .map(|(row, score)| {
                    Ok(ScoredChunk {
                        chunk: row.into_chunk()?,
                        score,
                    })
                })
                .collect()
        })
    }

    /// Every chunk of one document, in order.
    pub fn document_chunks(&self, project_id: &str, source_path: &str) -> MemoryResult<Vec<Chunk>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ?1 AND source_path = ?2 \
             ORDER BY chunk_index"
        );
        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&sql).storage("prepare document_chunks")?;
            let rows = stmt
                .query_map(params![project_id, source_path], ChunkRow::from_row)
                .storage("document_chunks")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read chunks")?;
            rows.into_iter().map(ChunkRow::into_chunk).collect()
        })
    }

    pub fn document(&self, project_id: &str, source_path: &str) -> MemoryResult<Option<DocumentInfo>> {
        self.pool.read(|conn| {
            conn.query_row(
                "SELECT project_id, source_path, content_hash, chunk_count, metadata, ingested_at \
                 FROM documents WHERE project_id = ?1 AND source_path = ?2",
                params![project_id, source_path],
                read_document,
            )
            .optional()
            .storage("get_document")
        })
    }

    pub fn list_documents(&self, project_id: &str) -> MemoryResult<Vec<DocumentInfo>> {
        self.pool.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT project_id, source_path, content_hash, chunk_count, metadata, ingested_at \
                     FROM documents WHERE project_id = ?1 ORDER BY source_path",
                )
                .storage("prepare list_documents")?;
            let docs = stmt
                .query_map([project_id], read_document)
                .storage("list_documents")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read documents")?;
            Ok(docs)
        })
    }

    pub fn count_chunks(&self, project_id: &str) -> MemoryResult<u64> {
        self.pool.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE project_id = ?1",
                [project_id],
                |row| row.get::<_, i64>(0),
            )
            .storage("count_chunks")
            .map(|n| n as u64)
        })
    }

    /// The pool backing this store.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn close(&self) {
        self.pool.close_all();
    }

    /// Fingerprint of everything that shapes the stored chunks.
    fn ingest_hash(&self, raw_text: &str, document_metadata: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(raw_text.as_bytes());
        hasher.update(&[0]);
        hasher.update(document_metadata.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(self.chunking.chunk_size as u64).to_le_bytes());
        hasher.update(&(self.chunking.chunk_overlap as u64).to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn split(&self, source_path: &str, raw_text: &str) -> Vec<TextChunk> {
        let (size, overlap) = (self.chunking.chunk_size, self.chunking.chunk_overlap);
        if is_code_path(source_path) {
            chunk_code(raw_text, size, overlap)
        } else {
            chunk_spans(raw_text, size, overlap)
        }
    }
}

fn read_document(row: &Row<'_>) -> rusqlite::Result<DocumentInfo> {
    let metadata = match row.get::<_, Option<String>>(4)? {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        None => serde_json::json!({}),
    };
    Ok(DocumentInfo {
        project_id: row.get(0)?,
        source_path: row.get(1)?,
        content_hash: row.get(2)?,
        chunk_count: row.get::<_, i64>(3)? as usize,
        metadata,
        ingested_at: row.get(5)?,
    })
}

fn count_document_chunks(conn: &Connection, project_id: &str, source_path: &str) -> MemoryResult<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM chunks WHERE project_id = ?1 AND source_path = ?2",
        params![project_id, source_path],
        |row| row.get::<_, i64>(0),
    )
    .storage("count document chunks")
    .map(|n| n as usize)
}

fn is_code_path(source_path: &str) -> bool {
    Path::new(source_path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
