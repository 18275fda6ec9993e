//! Symbolic tier: authoritative key/value facts.
//!
//! At most one fact exists per `(scope, key)`; [`SymbolicStore::put_fact`] updates in
//! place, keeping the id and bumping `updated_at`. Confidence is fixed at 1.0 and the
//! schema rejects anything else.

use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::schema::{init_schema, TierSchema};
use crate::db::{ConnectionPool, PoolSettings, PoolStats};
use crate::error::{MemoryError, MemoryResult, StorageContext};
use crate::memory::types::{Fact, FactFilter, Scope};
use crate::memory::{fts_all_terms, fts_any_prefix, now_timestamp, search_terms, write_audit_log};

/// Upper bound on candidates fetched for the key-in-question fallback.
const KEY_CANDIDATES: usize = 256;

const FACT_COLUMNS: &str =
    "f.id, f.scope, f.category, f.key, f.value, f.confidence, f.source, f.created_at, f.updated_at";

/// Raw `facts` row before the scope and JSON value are parsed.
struct FactRow {
    id: String,
    scope: String,
    category: String,
    key: String,
    value: String,
    confidence: f64,
    source: Option<String>,
    created_at: String,
    updated_at: String,
}

impl FactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope: row.get(1)?,
            category: row.get(2)?,
            key: row.get(3)?,
            value: row.get(4)?,
            confidence: row.get(5)?,
            source: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_fact(self) -> MemoryResult<Fact> {
        Ok(Fact {
            id: self.id,
            scope: self.scope.parse()?,
            category: self.category,
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            confidence: self.confidence,
            source: self.source,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SymbolicStore {
    pool: ConnectionPool,
}

impl SymbolicStore {
    /// Open (or create) the symbolic database at `path`.
    pub fn open(path: impl AsRef<Path>, settings: PoolSettings) -> MemoryResult<Self> {
        let pool = ConnectionPool::open(path, settings)?;
        pool.write(|conn| init_schema(conn, TierSchema::Symbolic))?;
        tracing::info!(path = %pool.path().display(), "symbolic store opened");
        Ok(Self { pool })
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    /// Insert a fact, or update the existing fact with the same `(scope, key)`.
    ///
    /// `category` defaults to `"general"` on insert; on update a `None` category or
    /// source keeps the stored one.
    pub fn put_fact(
        &self,
        scope: Scope,
        key: &str,
        value: serde_json::Value,
        category: Option<&str>,
        source: Option<&str>,
    ) -> MemoryResult<Fact> {
        let key = key.trim();
        if key.is_empty() {
            return Err(MemoryError::validation("fact key must not be empty"));
        }
        if is_empty_value(&value) {
            return Err(MemoryError::validation(format!(
                "fact value for `{key}` must not be empty"
            )));
        }
        let value_json = serde_json::to_string(&value)?;

        self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin put_fact")?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM facts WHERE scope = ?1 AND key = ?2",
                    params![scope.as_str(), key],
                    |row| row.get(0),
                )
                .optional()
                .storage("put_fact lookup")?;

            let now = now_timestamp();
            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE facts SET value = ?1, category = COALESCE(?2, category), \
                         source = COALESCE(?3, source), updated_at = ?4 WHERE id = ?5",
                        params![value_json, category, source, now, id],
                    )
                    .storage("put_fact update")?;
                    write_audit_log(&tx, "update", &id, Some(&serde_json::json!({"key": key})))?;
                    tracing::debug!(id = %id, scope = %scope, key, "fact updated");
                    id
                }
                None => {
                    let id = uuid::Uuid::now_v7().to_string();
                    tx.execute(
                        "INSERT INTO facts (id, scope, category, key, value, confidence, source, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 1.0, ?6, ?7, ?7)",
                        params![
                            id,
                            scope.as_str(),
                            category.unwrap_or("general"),
                            key,
                            value_json,
                            source,
                            now,
                        ],
                    )
                    .storage("put_fact insert")?;
                    write_audit_log(&tx, "create", &id, Some(&serde_json::json!({"key": key})))?;
                    tracing::debug!(id = %id, scope = %scope, key, "fact created");
                    id
                }
            };

            let fact = fetch_fact(&tx, &id)?.ok_or_else(|| MemoryError::not_found("fact", &id))?;
            tx.commit().storage("commit put_fact")?;
            Ok(fact)
        })
    }

    pub fn get(&self, id: &str) -> MemoryResult<Fact> {
        self.pool
            .read(|conn| fetch_fact(conn, id))?
            .ok_or_else(|| MemoryError::not_found("fact", id))
    }

    pub fn delete(&self, id: &str) -> MemoryResult<()> {
        self.pool.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage("begin delete_fact")?;
            let removed = tx
                .execute("DELETE FROM facts WHERE id = ?1", [id])
                .storage("delete_fact")?;
            if removed == 0 {
                return Err(MemoryError::not_found("fact", id));
            }
            write_audit_log(&tx, "delete", id, None)?;
            tx.commit().storage("commit delete_fact")?;
            tracing::debug!(id, "fact deleted");
            Ok(())
        })
    }

    /// Facts matching every set filter field, most recently updated first.
    pub fn query(&self, filter: &FactFilter) -> MemoryResult<Vec<Fact>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(scope) = filter.scope {
            clauses.push("f.scope = ?");
            values.push(Value::Text(scope.as_str().to_string()));
        }
        if let Some(category) = &filter.category {
            clauses.push("f.category = ?");
            values.push(Value::Text(category.clone()));
        }
        if let Some(min) = filter.confidence_min {
            clauses.push("f.confidence >= ?");
            values.push(Value::Real(min));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM facts f {where_clause} ORDER BY f.updated_at DESC, f.rowid DESC"
        );

        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&sql).storage("prepare query_facts")?;
            let rows = stmt
                .query_map(params_from_iter(values), FactRow::from_row)
                .storage("query_facts")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read facts")?;
            rows.into_iter().map(FactRow::into_fact).collect()
        })
    }

    /// Facts matching `text`, best first.
    ///
    /// Facts whose key, value, or category contain every non-stopword term of `text`
    /// win, by full-text rank then most recently updated. When none do, a fact still
    /// matches if every term of its key appears in `text`, so "what's the current
    /// phase3 status" finds `phase3_status`; keys with more terms rank first there.
    pub fn search(&self, text: &str, limit: usize) -> MemoryResult<Vec<Fact>> {
        let Some(expr) = fts_all_terms(text) else {
            return Ok(Vec::new());
        };
        let facts = self.fts_facts(&expr, limit)?;
        if !facts.is_empty() {
            return Ok(facts);
        }
        self.search_by_key(text, limit)
    }

    fn search_by_key(&self, text: &str, limit: usize) -> MemoryResult<Vec<Fact>> {
        let Some(expr) = fts_any_prefix(text) else {
            return Ok(Vec::new());
        };
        let query_terms = search_terms(text);
        let mut matched: Vec<(usize, Fact)> = self
            .fts_facts(&expr, KEY_CANDIDATES)?
            .into_iter()
            .filter_map(|fact| {
                let key_terms = search_terms(&fact.key);
                let covered =
                    !key_terms.is_empty() && key_terms.iter().all(|t| query_terms.contains(t));
                covered.then_some((key_terms.len(), fact))
            })
            .collect();
        matched.sort_by(|(a, fa), (b, fb)| b.cmp(a).then_with(|| fb.updated_at.cmp(&fa.updated_at)));
        Ok(matched.into_iter().take(limit).map(|(_, fact)| fact).collect())
    }

    fn fts_facts(&self, expr: &str, limit: usize) -> MemoryResult<Vec<Fact>> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM facts_fts JOIN facts f ON f.rowid = facts_fts.rowid \
             WHERE facts_fts MATCH ?1 ORDER BY rank, f.updated_at DESC LIMIT ?2"
        );

        self.pool.read(|conn| {
            let mut stmt = conn.prepare(&sql).storage("prepare search_facts")?;
            let rows = stmt
                .query_map(params![expr, limit as i64], FactRow::from_row)
                .storage("search_facts")?
                .collect::<Result<Vec<_>, _>>()
                .storage("read facts")?;
            rows.into_iter().map(FactRow::into_fact).collect()
        })
    }

    pub fn count(&self) -> MemoryResult<u64> {
        self.pool.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM facts", [], |row| row.get::<_, i64>(0))
                .storage("count_facts")
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

fn fetch_fact(conn: &Connection, id: &str) -> MemoryResult<Option<Fact>> {
    let sql = format!("SELECT {FACT_COLUMNS} FROM facts f WHERE f.id = ?1");
    conn.query_row(&sql, [id], FactRow::from_row)
        .optional()
        .storage("get_fact")?
        .map(FactRow::into_fact)
        .transpose()
}

/// Null, blank strings, and empty arrays or objects carry no fact.
fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> (tempfile::TempDir, SymbolicStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SymbolicStore::open(tmp.path().join("symbolic.db"), PoolSettings::default()).unwrap();
        (tmp, store)
    }

    #[test]
    fn empty_values_are_rejected() {
        for value in [json!(null), json!("  "), json!([]), json!({})] {
            assert!(is_empty_value(&value), "{value} should be empty");
        }
        for value in [json!(0), json!(false), json!("x"), json!([1])] {
            assert!(!is_empty_value(&value), "{value} should not be empty");
        }
    }

    #[test]
    fn put_then_get() {
        let (_tmp, store) = test_store();
        let fact = store
            .put_fact(Scope::Project, "db_engine", json!("sqlite"), None, Some("README"))
            .unwrap();
        assert_eq!(fact.category, "general");
        assert_eq!(fact.confidence, 1.0);
        assert_eq!(fact.created_at, fact.updated_at);

        let fetched = store.get(&fact.id).unwrap();
        assert_eq!(fetched, fact);
    }

    #[test]
    fn update_keeps_category_when_unset() {
        let (_tmp, store) = test_store();
        let first = store
            .put_fact(Scope::User, "editor", json!("vim"), Some("preference"), None)
            .unwrap();
        let second = store
            .put_fact(Scope::User, "editor", json!("helix"), None, None)
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.category, "preference");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn delete_missing_fact_is_not_found() {
        let (_tmp, store) = test_store();
        let err = store.delete("no-such-id").unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { entity: "fact", .. }));
    }

    #[test]
    fn search_requires_every_term() {
        let (_tmp, store) = test_store();
        store
            .put_fact(Scope::Project, "phase3_status", json!("complete"), None, None)
            .unwrap();
        store
            .put_fact(Scope::Project, "phase4_status", json!("planned"), None, None)
            .unwrap();

        let hits = store.search("phase3_status", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "phase3_status");

        assert!(store.search("phase3 rollback", 10).unwrap().is_empty());
        assert!(store.search("the of", 10).unwrap().is_empty());
    }

    #[test]
    fn key_named_inside_a_question_matches() {
        let (_tmp, store) = test_store();
        store
            .put_fact(Scope::Project, "phase3_status", json!("complete"), None, None)
            .unwrap();
        store
            .put_fact(Scope::Project, "status", json!("green"), None, None)
            .unwrap();

        let hits = store.search("what's the current phase3 status", 10).unwrap();
        let keys: Vec<&str> = hits.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["phase3_status", "status"]);

        assert!(store.search("what's the current phase4 plan", 10).unwrap().is_empty());
    }
}
