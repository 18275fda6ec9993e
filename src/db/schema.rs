//! SQL DDL for the three tier databases.
//!
//! Each tier owns its own database file with one primary table (`facts`,
//! `episodes`, `chunks` + `documents`), an FTS5 index where the tier supports text
//! search, a `memory_log` audit table, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{MemoryError, MemoryResult, StorageContext};

/// The schema version that the current binary writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Which tier a database file belongs to. Stamped into `schema_meta` on first open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSchema {
    Symbolic,
    Episodic,
    Semantic,
}

impl TierSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symbolic => "symbolic",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }

    fn ddl(&self) -> &'static str {
        match self {
            Self::Symbolic => SYMBOLIC_SQL,
            Self::Episodic => EPISODIC_SQL,
            Self::Semantic => SEMANTIC_SQL,
        }
    }
}

/// Tables shared by every tier database.
const COMMON_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','delete','ingest')),
    record_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);
"#;

const SYMBOLIC_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL CHECK(scope IN ('session','project','user','org')),
    category TEXT NOT NULL DEFAULT 'general',
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0 CHECK(confidence = 1.0),
    source TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(scope, key)
);

CREATE INDEX IF NOT EXISTS idx_facts_category ON facts(category);
CREATE INDEX IF NOT EXISTS idx_facts_updated ON facts(updated_at);

CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    key,
    value,
    category,
    content='facts',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO facts_fts(rowid, key, value, category)
    VALUES (new.rowid, new.key, new.value, new.category);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, key, value, category)
    VALUES ('delete', old.rowid, old.key, old.value, old.category);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, key, value, category)
    VALUES ('delete', old.rowid, old.key, old.value, old.category);
    INSERT INTO facts_fts(rowid, key, value, category)
    VALUES (new.rowid, new.key, new.value, new.category);
END;
"#;

const EPISODIC_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    situation TEXT NOT NULL,
    action TEXT NOT NULL,
    outcome TEXT NOT NULL,
    lesson TEXT NOT NULL,
    lesson_type TEXT NOT NULL CHECK(lesson_type IN ('pattern','mistake','success','failure','general')),
    quality REAL NOT NULL CHECK(quality >= 0.0 AND quality <= 1.0),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_project ON episodes(project_id);
CREATE INDEX IF NOT EXISTS idx_episodes_quality ON episodes(quality);

CREATE VIRTUAL TABLE IF NOT EXISTS episodes_fts USING fts5(
    situation,
    action,
    outcome,
    lesson,
    content='episodes',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS episodes_ai AFTER INSERT ON episodes BEGIN
    INSERT INTO episodes_fts(rowid, situation, action, outcome, lesson)
    VALUES (new.rowid, new.situation, new.action, new.outcome, new.lesson);
END;

CREATE TRIGGER IF NOT EXISTS episodes_ad AFTER DELETE ON episodes BEGIN
    INSERT INTO episodes_fts(episodes_fts, rowid, situation, action, outcome, lesson)
    VALUES ('delete', old.rowid, old.situation, old.action, old.outcome, old.lesson);
END;
"#;

const SEMANTIC_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    project_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    chunk_count INTEGER NOT NULL,
    metadata TEXT,
    ingested_at TEXT NOT NULL,
    PRIMARY KEY (project_id, source_path)
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(project_id, source_path, chunk_index),
    FOREIGN KEY (project_id, source_path)
        REFERENCES documents(project_id, source_path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_project ON chunks(project_id);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(project_id, source_path);
"#;

/// Create the tables for `tier` and stamp the database with it.
///
/// Fails with a validation error if the file was already stamped as another tier,
/// so a symbolic store can never silently open the episodic database.
pub fn init_schema(conn: &Connection, tier: TierSchema) -> MemoryResult<()> {
    conn.execute_batch(COMMON_SQL).storage("create common tables")?;

    match get_meta(conn, "tier")? {
        Some(existing) if existing != tier.as_str() => {
            return Err(MemoryError::validation(format!(
                "database belongs to the {existing} tier, cannot open it as {}",
                tier.as_str()
            )));
        }
        Some(_) => {}
        None => set_meta(conn, "tier", tier.as_str())?,
    }

    conn.execute_batch(tier.ddl()).storage("create tier tables")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [CURRENT_SCHEMA_VERSION.to_string()],
    )
    .storage("record schema version")?;

    Ok(())
}

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> MemoryResult<u32> {
    Ok(get_meta(conn, "schema_version")?
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0))
}

/// Read a `schema_meta` value, if present.
pub fn get_meta(conn: &Connection, key: &str) -> MemoryResult<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .storage("read schema_meta")
}

/// Insert or replace a `schema_meta` value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> MemoryResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )
    .storage("write schema_meta")?;
    Ok(())
}
