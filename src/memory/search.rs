//! Hybrid retrieval: fuses vector similarity and BM25 term scores into one ranking.
//!
//! `score = semantic_weight × cosine + lexical_weight × normalized_bm25`. Ties fall back to
//! importance, then recency, then record id, so identical inputs always rank identically.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::embedding::{truncate_chars, EmbeddingProvider};
use crate::memory::lexical::LexicalIndex;
use crate::memory::records::RecordStore;
use crate::memory::types::{MemoryRecord, SHARED_NAMESPACE};
use crate::memory::vector::VectorIndex;

/// Shape of recall results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecallMode {
    /// Complete records.
    #[default]
    Full,
    /// Id, location, short preview and score only.
    IdsOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub preview: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RecallResponse {
    Full { results: Vec<ScoredRecord> },
    IdsOnly { results: Vec<RecordSummary> },
}

impl RecallResponse {
    pub fn len(&self) -> usize {
        match self {
            Self::Full { results } => results.len(),
            Self::IdsOnly { results } => results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record ids in rank order.
    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::Full { results } => results.iter().map(|r| r.record.id.clone()).collect(),
            Self::IdsOnly { results } => results.iter().map(|r| r.id.clone()).collect(),
        }
    }

    /// Scores in rank order.
    pub fn scores(&self) -> Vec<f64> {
        match self {
            Self::Full { results } => results.iter().map(|r| r.score).collect(),
            Self::IdsOnly { results } => results.iter().map(|r| r.score).collect(),
        }
    }
}

pub struct HybridEngine {
    records: RecordStore,
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl HybridEngine {
    pub fn new(
        records: RecordStore,
        vectors: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            records,
            vectors,
            lexical,
            embedder,
            config,
        }
    }

    /// Rank the owner's records against `query`.
    ///
    /// `namespace = None` searches every namespace of the owner; `Some(ns)` searches `ns`
    /// and the shared namespace. Returned records have their access counters bumped.
    pub fn recall(
        &self,
        owner: &str,
        namespace: Option<&str>,
        query: &str,
        k: Option<usize>,
        mode: RecallMode,
    ) -> Result<RecallResponse> {
        let query = truncate_chars(query.trim(), self.embedder.max_input_chars());
        let k = k
            .unwrap_or(self.config.default_k)
            .clamp(1, self.config.max_k.max(1));
        let namespaces = namespace.map(namespace_set);
        let candidates = k.saturating_mul(self.config.candidate_multiplier.max(1));

        let query_vec = self.embedder.embed(query)?;
        let semantic =
            self.vectors
                .search(owner, namespaces.as_deref(), &query_vec, candidates)?;
        let lexical = self
            .lexical
            .search(owner, namespaces.as_deref(), query, candidates)?;

        let fused = fuse(
            &semantic,
            &lexical,
            self.config.semantic_weight,
            self.config.lexical_weight,
        );
        let ids: Vec<String> = fused.keys().cloned().collect();
        let mut found = self.records.get_many(owner, &ids)?;

        let mut ranked: Vec<ScoredRecord> = fused
            .into_iter()
            .filter_map(|(id, score)| {
                found
                    .remove(&id)
                    .map(|record| ScoredRecord { record, score })
            })
            .collect();
        ranked.sort_by(rank_order);
        ranked.truncate(k);

        tracing::debug!(
            owner = %owner,
            semantic = semantic.len(),
            lexical = lexical.len(),
            returned = ranked.len(),
            "recall ranked"
        );

        let returned: Vec<String> = ranked.iter().map(|r| r.record.id.clone()).collect();
        self.records.touch(&returned)?;

        Ok(match mode {
            RecallMode::Full => RecallResponse::Full { results: ranked },
            RecallMode::IdsOnly => RecallResponse::IdsOnly {
                results: ranked
                    .into_iter()
                    .map(|r| RecordSummary {
                        preview: preview(&r.record.value, self.config.preview_chars),
                        id: r.record.id,
                        namespace: r.record.namespace,
                        key: r.record.key,
                        score: r.score,
                    })
                    .collect(),
            },
        })
    }
}

/// `ns` plus the shared namespace, without duplicates.
fn namespace_set(ns: &str) -> Vec<String> {
    if ns == SHARED_NAMESPACE {
        vec![ns.to_string()]
    } else {
        vec![ns.to_string(), SHARED_NAMESPACE.to_string()]
    }
}

/// Weighted sum of both signals per record. Records with a non-positive total are dropped.
fn fuse(
    semantic: &[(String, f64)],
    lexical: &[(String, f64)],
    semantic_weight: f64,
    lexical_weight: f64,
) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for (id, cosine) in semantic {
        *scores.entry(id.clone()).or_insert(0.0) += semantic_weight * cosine;
    }
    for (id, term_score) in lexical {
        *scores.entry(id.clone()).or_insert(0.0) += lexical_weight * term_score;
    }
    scores.retain(|_, score| score.is_finite() && *score > 0.0);
    scores
}

fn rank_order(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.record.importance.total_cmp(&a.record.importance))
        .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Short text preview of a record value, with "..." appended when truncated.
pub fn preview(value: &serde_json::Value, max_chars: usize) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let cut = truncate_chars(&text, max_chars);
    if cut.len() < text.len() {
        format!("{cut}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::embedding::hashed::HashedEmbeddingProvider;
    use crate::memory::lexical::Fts5LexicalIndex;
    use crate::memory::types::{record_id, record_text};
    use crate::memory::vector::SqliteVectorIndex;
    use crate::memory::IndexEntry;
    use serde_json::json;

    struct Fixture {
        engine: HybridEngine,
        records: RecordStore,
        vectors: Arc<SqliteVectorIndex>,
        lexical: Arc<Fts5LexicalIndex>,
        embedder: Arc<HashedEmbeddingProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Db::open_in_memory().unwrap();
            let records = RecordStore::new(db.clone());
            let vectors = Arc::new(SqliteVectorIndex::new(db.clone()));
            let lexical = Arc::new(Fts5LexicalIndex::new(db));
            let embedder = Arc::new(HashedEmbeddingProvider::default());
            let engine = HybridEngine::new(
                records.clone(),
                vectors.clone(),
                lexical.clone(),
                embedder.clone(),
                RetrievalConfig::default(),
            );
            Self {
                engine,
                records,
                vectors,
                lexical,
                embedder,
            }
        }

        /// Store and index synchronously.
        fn add(&self, owner: &str, ns: &str, key: &str, value: serde_json::Value, importance: f64) {
            self.records
                .put(owner, ns, key, value.clone(), vec![], importance)
                .unwrap();
            let id = record_id(owner, ns, key);
            let entry = IndexEntry {
                record_id: &id,
                owner_id: owner,
                namespace: ns,
            };
            let text = record_text(key, &value, &[]);
            self.lexical.upsert(&entry, &text).unwrap();
            let vec = self.embedder.embed(&text).unwrap();
            self.vectors.upsert(&entry, &[vec]).unwrap();
        }
    }

    #[test]
    fn preferred_language_ranks_lang_pref_first() {
        let f = Fixture::new();
        f.add("u1", "shared", "lang_pref", json!("prefers Go"), 0.5);
        f.add("u1", "shared", "editor", json!("uses neovim daily"), 0.5);
        f.add("u1", "shared", "pet", json!("has a cat named Miso"), 0.5);

        let res = f
            .engine
            .recall("u1", None, "preferred language", None, RecallMode::Full)
            .unwrap();
        assert_eq!(res.ids()[0], record_id("u1", "shared", "lang_pref"));
    }

    #[test]
    fn ranking_is_deterministic() {
        let f = Fixture::new();
        for i in 0..10 {
            f.add("u1", "shared", &format!("note_{i}"), json!(format!("rust note {i}")), 0.5);
        }
        let first = f
            .engine
            .recall("u1", None, "rust note", Some(10), RecallMode::IdsOnly)
            .unwrap();
        let second = f
            .engine
            .recall("u1", None, "rust note", Some(10), RecallMode::IdsOnly)
            .unwrap();
        assert_eq!(first.ids(), second.ids());
        assert_eq!(first.scores(), second.scores());
    }

    #[test]
    fn empty_index_returns_empty() {
        let f = Fixture::new();
        let res = f
            .engine
            .recall("u1", None, "anything", None, RecallMode::Full)
            .unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn other_owners_are_invisible() {
        let f = Fixture::new();
        f.add("a", "shared", "secret", json!("launch codes"), 0.5);
        let res = f
            .engine
            .recall("b", None, "launch codes secret", None, RecallMode::Full)
            .unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn namespace_filter_includes_shared() {
        let f = Fixture::new();
        f.add("u1", "work", "deadline", json!("friday release"), 0.5);
        f.add("u1", "shared", "deadline_shared", json!("friday release"), 0.5);
        f.add("u1", "home", "deadline_home", json!("friday release"), 0.5);

        let res = f
            .engine
            .recall("u1", Some("work"), "friday release", Some(10), RecallMode::Full)
            .unwrap();
        let ids = res.ids();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&record_id("u1", "home", "deadline_home")));
    }

    #[test]
    fn k_is_clamped() {
        let f = Fixture::new();
        for i in 0..3 {
            f.add("u1", "shared", &format!("k{i}"), json!("tea"), 0.5);
        }
        let res = f
            .engine
            .recall("u1", None, "tea", Some(0), RecallMode::Full)
            .unwrap();
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn ties_break_on_importance_then_id() {
        let f = Fixture::new();
        f.add("u1", "shared", "same", json!("identical text"), 0.2);
        // Same indexed text under a different namespace gives an identical score.
        f.add("u1", "other", "same", json!("identical text"), 0.9);

        let res = f
            .engine
            .recall("u1", None, "identical text", Some(2), RecallMode::Full)
            .unwrap();
        assert_eq!(res.ids()[0], record_id("u1", "other", "same"));
    }

    #[test]
    fn oversized_query_is_truncated() {
        let f = Fixture::new();
        f.add("u1", "shared", "topic", json!("gardening tips"), 0.5);
        let query = format!("gardening {}", "x".repeat(10_000));
        let res = f
            .engine
            .recall("u1", None, &query, None, RecallMode::IdsOnly)
            .unwrap();
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn recall_tracks_access() {
        let f = Fixture::new();
        f.add("u1", "shared", "k", json!("coffee order oat latte"), 0.5);
        f.engine
            .recall("u1", None, "coffee", None, RecallMode::Full)
            .unwrap();
        let record = f.records.get("u1", "shared", "k").unwrap().unwrap();
        assert_eq!(record.access_count, 1);
    }

    #[test]
    fn fuse_drops_non_positive() {
        let semantic = vec![("a".to_string(), 0.5), ("b".to_string(), -0.2)];
        let lexical = vec![("a".to_string(), 1.0)];
        let fused = fuse(&semantic, &lexical, 0.7, 0.3);
        assert_eq!(fused.len(), 1);
        assert!((fused["a"] - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview(&json!("short"), 10), "short");
        assert_eq!(preview(&json!("a longer value"), 8), "a longer...");
        assert_eq!(preview(&json!({"k": 1}), 100), "{\"k\":1}");
    }
}
