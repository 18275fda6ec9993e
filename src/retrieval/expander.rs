//! Query expansion for the semantic tier.
//!
//! Short or code-like queries are searched as-is. Longer natural-language queries get
//! up to `max_expansions` alternative phrasings, generated by an injected
//! [`TextGenerator`] when one is configured, by rules otherwise. Expansions are cached
//! per normalized query, and feedback about which variants produced results reorders
//! later answers without changing the set.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::embedding::TextGenerator;
use crate::memory::search_terms;

const EXPANSION_CACHE_SIZE: usize = 512;

/// Words that make a short query hard to match literally.
const VAGUE_WORDS: &[&str] = &["it", "this", "that", "thing", "stuff", "issue", "problem"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Mentions an identifier, path, or call.
    CodeLookup,
    /// Short or vague natural language.
    Ambiguous,
    Generic,
}

#[derive(Debug, Clone)]
struct Expansion {
    variants: Vec<String>,
    /// The `max_expansions` these variants were generated for.
    requested: usize,
    /// Variants reported useful, most recent report first.
    useful: Vec<String>,
}

impl Expansion {
    fn ordered(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .useful
            .iter()
            .filter(|u| self.variants.contains(u))
            .cloned()
            .collect();
        out.extend(
            self.variants
                .iter()
                .filter(|v| !self.useful.contains(v))
                .cloned(),
        );
        out
    }
}

pub struct QueryExpander {
    enabled: bool,
    max_expansions: usize,
    generator: Option<Arc<dyn TextGenerator>>,
    cache: Mutex<LruCache<String, Expansion>>,
    computed: AtomicU64,
}

impl QueryExpander {
    pub fn new(enabled: bool, max_expansions: usize) -> Self {
        Self {
            enabled,
            max_expansions,
            generator: None,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EXPANSION_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            computed: AtomicU64::new(0),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn max_expansions(&self) -> usize {
        self.max_expansions
    }

    /// How many expansion sets were computed rather than served from cache.
    pub fn computed(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn should_expand(&self, query: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let words = query.split_whitespace().count();
        if words < 3 {
            return false;
        }
        !(words <= 4 && has_code_reference(query))
    }

    pub fn classify(&self, query: &str) -> QueryType {
        if has_code_reference(query) {
            return QueryType::CodeLookup;
        }
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .collect();
        if words.len() <= 5 || words.iter().any(|w| VAGUE_WORDS.contains(&w.as_str())) {
            QueryType::Ambiguous
        } else {
            QueryType::Generic
        }
    }

    /// The query followed by up to `max_expansions` variants.
    ///
    /// Returns just the query when it should not be expanded.
    pub fn expand(&self, query: &str, max_expansions: usize) -> Vec<String> {
        let mut out = vec![query.to_string()];
        if max_expansions == 0 || !self.should_expand(query) {
            return out;
        }

        // a set generated for a smaller max is regenerated, keeping its feedback
        let key = normalize(query);
        let useful = match self.cache.lock().get(&key) {
            Some(cached) if cached.requested >= max_expansions => {
                out.extend(cached.ordered().into_iter().take(max_expansions));
                return out;
            }
            Some(cached) => cached.useful.clone(),
            None => Vec::new(),
        };

        let variants = self.generate_variants(query, max_expansions);
        self.computed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(query, variants = variants.len(), "query expanded");

        let expansion = Expansion {
            variants,
            requested: max_expansions,
            useful,
        };
        out.extend(expansion.ordered());
        self.cache.lock().put(key, expansion);
        out
    }

    /// Remember which variants contributed results for `query`.
    pub fn record_feedback(&self, query: &str, useful_expansions: &[String]) {
        let key = normalize(query);
        let mut cache = self.cache.lock();
        let Some(entry) = cache.get_mut(&key) else {
            return;
        };
        let mut useful: Vec<String> = Vec::new();
        for u in useful_expansions.iter().chain(entry.useful.iter()) {
            if entry.variants.contains(u) && !useful.contains(u) {
                useful.push(u.clone());
            }
        }
        tracing::debug!(query, useful = useful.len(), "expansion feedback recorded");
        entry.useful = useful;
    }

    fn generate_variants(&self, query: &str, max: usize) -> Vec<String> {
        let query_type = self.classify(query);
        if let Some(generator) = &self.generator {
            let prompt = format!(
                "Rewrite the following {} search query in {max} different ways, one per line, \
                 without numbering:\n{query}",
                match query_type {
                    QueryType::CodeLookup => "code",
                    QueryType::Ambiguous => "short or vague",
                    QueryType::Generic => "documentation",
                }
            );
            match generator.generate(&prompt) {
                Ok(text) => {
                    let variants = dedup_variants(query, text.lines().map(strip_list_marker), max);
                    if !variants.is_empty() {
                        return variants;
                    }
                    tracing::warn!(query, "generator returned no usable variants, using rules");
                }
                Err(e) => {
                    tracing::warn!(query, error = %e, "query generator failed, using rules");
                }
            }
        }
        rule_variants(query, query_type, max)
    }
}

impl std::fmt::Debug for QueryExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExpander")
            .field("enabled", &self.enabled)
            .field("max_expansions", &self.max_expansions)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

/// Lowercase with whitespace collapsed.
pub fn normalize(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identifier-like tokens: `snake_case`, `camelCase`, `a::b`, `call()`, `file.rs`,
/// or anything in backticks.
pub fn has_code_reference(query: &str) -> bool {
    query.split_whitespace().any(is_code_token)
}

fn is_code_token(token: &str) -> bool {
    if token.contains("::") || token.contains("()") || token.contains('`') {
        return true;
    }
    let word = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
    if word.is_empty() {
        return false;
    }
    let snake = word.contains('_') && word.chars().any(|c| c.is_alphanumeric());
    let camel = word
        .chars()
        .zip(word.chars().skip(1))
        .any(|(a, b)| a.is_lowercase() && b.is_uppercase());
    let dotted = word
        .split_once('.')
        .is_some_and(|(a, b)| !a.is_empty() && !b.is_empty() && b.chars().all(|c| c.is_alphanumeric() || c == '.'));
    snake || camel || dotted
}

fn strip_list_marker(line: &str) -> &str {
    line.trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
        .trim()
}

fn dedup_variants<'a>(query: &str, candidates: impl Iterator<Item = &'a str>, max: usize) -> Vec<String> {
    let original = normalize(query);
    let mut seen: Vec<String> = vec![original];
    let mut out = Vec::new();
    for candidate in candidates {
        let norm = normalize(candidate);
        if norm.is_empty() || seen.contains(&norm) {
            continue;
        }
        seen.push(norm);
        out.push(candidate.trim().to_string());
        if out.len() == max {
            break;
        }
    }
    out
}

/// Split `snake_case`, `camelCase`, and `a::b` identifiers into words.
fn split_identifier(token: &str) -> String {
    let mut words = String::new();
    let mut prev_lower = false;
    for c in token.chars() {
        if c == '_' || c == ':' || c == '.' || c == '(' || c == ')' || c == '`' {
            if !words.ends_with(' ') && !words.is_empty() {
                words.push(' ');
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            words.push(' ');
        }
        words.extend(c.to_lowercase());
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
    }
    words.trim().to_string()
}

fn rule_variants(query: &str, query_type: QueryType, max: usize) -> Vec<String> {
    let keywords = search_terms(query).join(" ");
    let candidates: Vec<String> = match query_type {
        QueryType::CodeLookup => {
            let identifier = query
                .split_whitespace()
                .find(|t| is_code_token(t))
                .unwrap_or(query);
            let name = identifier.trim_matches('`');
            vec![
                query
                    .split_whitespace()
                    .map(|t| if is_code_token(t) { split_identifier(t) } else { t.to_string() })
                    .collect::<Vec<_>>()
                    .join(" "),
                format!("definition of {name}"),
                format!("usage of {name}"),
                keywords,
            ]
        }
        QueryType::Ambiguous => vec![
            keywords.clone(),
            format!("how to {keywords}"),
            format!("{keywords} explanation"),
            format!("{keywords} example"),
        ],
        QueryType::Generic => vec![
            keywords.clone(),
            format!("{keywords} overview"),
            format!("{keywords} details"),
        ],
    };
    dedup_variants(query, candidates.iter().map(String::as_str), max)
}
