//! Episodic tier: advisory lessons ranked by quality.
//!
//! Episodes are append-only; the only mutation is an administrative delete.

use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::schema::{init_schema, TierSchema};
use crate::db::{ConnectionPool, PoolSettings, PoolStats};
use crate::error::{MemoryError, MemoryResult, StorageContext};
use crate::memory::types::{Episode, EpisodeFilter, NewEpisode};
use crate::memory::{fts_any_prefix, now_timestamp, write_audit_log};

const EPISODE_COLUMNS: &str = "e.id, e.project_id, e.situation, e.action, e.outcome, e.lesson, \
     e.lesson_type, e.quality, e.created_at";

struct EpisodeRow {
    id: String,
    project_id: String,
    situation: String,
    action: String,
    outcome: String,
    lesson: String,
    lesson_type: String,
    quality: f64,
    created_at: String,
}

impl EpisodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            situation: row.get(2)?,
            action: row.get(3)?,
            outcome: row.get(4)?,
            lesson: row.get(5)?,
            lesson_type: row.get(6)?,
            quality: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_episode(self) -> MemoryResult<Episode> {
        Ok(Episode {
            id: self.id,
            project_id: self.project_id,
            situation: self.situation,
            action: self.action,
            outcome: self.outcome,
            lesson: self.lesson,
            lesson_type: self.lesson_type.parse()?,
            quality: self.quality,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EpisodicStore {
    pool: ConnectionPool,
}

impl EpisodicStore {
    /// Open (or create) the episodic database at `path`.
    pub fn open(path: impl AsRef<Path>, settings: PoolSettings) -> MemoryResult<Self> {
        let pool = ConnectionPool::open(path, settings)?;
        pool.write(|conn| init_schema(conn, TierSchema::Episodic))?;
        tracing::info!(path = %pool.path().display(), "episodic store opened");
        Ok(Self { pool })
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    pub fn add_episode(&self, new: NewEpisode) -> MemoryResult<Episode> {
        validate_episode(&new)?;

        let episode = Episode {
            id: uuid::Uuid::now_v7().to_string(),
            project_id: new.project_id,
            situation: new.situation,
            action: new.action,
            outcome: new.outcome,
            lesson: new.lesson,
            lesson_type: new.lesson_type,
            quality: new.quality,
            created_at: now_timestamp(),
        };

        self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin add_episode")?;
            tx.execute(
                "INSERT INTO episodes (id, project_id, situation, action, outcome, lesson, lesson_type, quality, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    episode.id,
                    episode.project_id,
                    episode.situation,
                    episode.action,
                    episode.outcome,
                    episode.lesson,
                    episode.lesson_type.as_str(),
                    episode.quality,
                    episode.created_at,
                ],
            )
            .storage("add_episode")?;
            write_audit_log(
                &tx,
                "create",
                &episode.id,
                Some(&serde_json::json!({
                    "project_id": episode.project_id,
                    "lesson_type": episode.lesson_type,
                })),
            )?;
            tx.commit().storage("commit add_episode")
        })?;

        tracing::debug!(
            id = %episode.id,
            project_id = %episode.project_id,
            quality = episode.quality,
            "episode added"
        );
        Ok(episode)
    }

    pub fn get(&self, id: &str) -> MemoryResult<Episode> {
        self.pool
            .read(|conn| fetch_episode(conn, id))?
            .ok_or_else(|| MemoryError::not_found("episode", id))
    }

    pub fn delete(&self, id: &str) -> MemoryResult<()> {
        self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin delete_episode")?;
            let removed = tx
                .execute("DELETE FROM episodes WHERE id = ?1", [id])
                .storage("delete_episode")?;
            if removed == 0 {
                return Err(MemoryError::not_found("episode", id));
            }
            write_audit_log(&tx, "delete", id, None)?;
            tx.commit().storage("commit delete_episode")
        })
    }

    /// Episodes of one project, best quality first, then newest.
    ///
    /// A `text` filter keeps episodes matching any of its non-stopword terms by
    /// prefix; text with no searchable terms matches nothing.
    pub fn query(&self, filter: &EpisodeFilter) -> MemoryResult<Vec<Episode>> {
        let mut from = String::from("episodes e");
        let mut clauses: Vec<&str> = vec!["e.project_id = ?"];
        let mut values: Vec<Value> = vec![Value::Text(filter.project_id.clone())];

        if let Some(text) = &filter.text {
            let Some(expr) = fts_any_prefix(text) else {
                return Ok(Vec::new());
            };
            from = String::from("episodes_fts JOIN episodes e ON e.rowid = episodes_fts.rowid");
            clauses.push("episodes_fts MATCH ?");
            values.push(Value::Text(expr));
        }
        if let Some(lesson_type) = filter.lesson_type {
            clauses.push("e.lesson_type = ?");
            values.push(Value::Text(lesson_type.as_str().to_string()));
        }
        if let Some(min) = filter.quality_min {
            clauses.push("e.quality >= ?");
            values.push(Value::Real(min));
        }
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        values.push(Value::Integer(limit));

        let sql = format!(
            "SELECT {EPISODE_COLUMNS} FROM {from} WHERE {} \
             ORDER BY e.quality DESC, e.created_at DESC, e.rowid DESC LIMIT ?",
            clauses.join(" AND ")
        );

        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&sql).storage("prepare query_episodes")?;
            let rows = stmt
                .query_map(params_from_iter(values), EpisodeRow::from_row)
                .storage("query_episodes")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read episodes")?;
            rows.into_iter().map(EpisodeRow::into_episode).collect()
        })
    }

    pub fn count(&self, project_id: &str) -> MemoryResult<u64> {
        self.pool.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM episodes WHERE project_id = ?1",
                [project_id],
                |row| row.get::<_, i64>(0),
            )
            .storage("count_episodes")
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
}

fn fetch_episode(conn: &Connection, id: &str) -> MemoryResult<Option<Episode>> {
    let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes e WHERE e.id = ?1");
    conn.query_row(&sql, [id], EpisodeRow::from_row)
        .optional()
        .storage("get_episode")?
        .map(EpisodeRow::into_episode)
        .transpose()
}

fn validate_episode(new: &NewEpisode) -> MemoryResult<()> {
    if !(0.0..=1.0).contains(&new.quality) {
        return Err(MemoryError::validation(format!(
            "episode quality must be within [0, 1], got {}",
            new.quality
        )));
    }
    let fields = [
        ("project_id", &new.project_id),
        ("situation", &new.situation),
        ("action", &new.action),
        ("outcome", &new.outcome),
        ("lesson", &new.lesson),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(MemoryError::validation(format!(
                "episode {name} must not be empty"
            )));
        }
    }
    Ok(())
}
