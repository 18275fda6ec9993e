pub mod chunker;
pub mod episodic;
pub mod semantic;
pub mod symbolic;
pub mod types;

use std::sync::atomic::{AtomicI64, Ordering};

use rusqlite::{params, Connection};

use crate::error::{MemoryResult, StorageContext};

static LAST_TIMESTAMP_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current UTC time as RFC 3339 with fixed microsecond precision.
///
/// Strictly increasing within the process, so lexical order of stored timestamps
/// matches write order even when two writes land in the same microsecond.
pub fn now_timestamp() -> String {
    let wall = chrono::Utc::now().timestamp_micros();
    let mut prev = LAST_TIMESTAMP_MICROS.load(Ordering::Relaxed);
    let micros = loop {
        let next = wall.max(prev + 1);
        match LAST_TIMESTAMP_MICROS.compare_exchange_weak(
            prev,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break next,
            Err(actual) => prev = actual,
        }
    };
    chrono::DateTime::from_timestamp_micros(micros)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "did", "do", "does", "for", "from",
    "how", "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "we",
    "what", "when", "where", "which", "who", "why", "with",
];

/// Lowercased alphanumeric terms of `text`, stopwords removed, first occurrence kept.
pub(crate) fn search_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !STOPWORDS.contains(&term.as_str()) && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// FTS5 expression requiring every term: `"a" "b"`. `None` if nothing is searchable.
pub(crate) fn fts_all_terms(text: &str) -> Option<String> {
    let terms = search_terms(text);
    (!terms.is_empty()).then(|| {
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" ")
    })
}

/// FTS5 expression matching any term by prefix: `"a"* OR "b"*`.
pub(crate) fn fts_any_prefix(text: &str) -> Option<String> {
    let terms = search_terms(text);
    (!terms.is_empty()).then(|| {
        terms
            .iter()
            .map(|t| format!("\"{t}\"*"))
            .collect::<Vec<_>>()
            .join(" OR ")
    })
}

/// Append a row to the tier's `memory_log`.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    record_id: &str,
    details: Option<&serde_json::Value>,
) -> MemoryResult<()> {
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, record_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, record_id, details_json, now_timestamp()],
    )
    .storage("write audit log")?;
    Ok(())
}

/// Encode an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes produced by [`embedding_to_bytes`].
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let stamps: Vec<String> = (0..200).map(|_| now_timestamp()).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(stamps[0].ends_with('Z'));
    }

    #[test]
    fn search_terms_drop_stopwords_and_duplicates() {
        assert_eq!(
            search_terms("What is the Status of the status page?"),
            vec!["status", "page"]
        );
        assert!(search_terms("is the of").is_empty());
    }

    #[test]
    fn fts_expressions() {
        assert_eq!(fts_all_terms("phase3_status").as_deref(), Some("\"phase3\" \"status\""));
        assert_eq!(
            fts_any_prefix("retry backoff").as_deref(),
            Some("\"retry\"* OR \"backoff\"*")
        );
        assert_eq!(fts_all_terms("\"\" OR"), None);
    }

    #[test]
    fn embedding_bytes_round_trip_exactly() {
        let v = vec![0.1f32, -2.5, f32::MIN_POSITIVE, 1.0e-7];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(embedding_from_bytes(&bytes), v);
    }
}
