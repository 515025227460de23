//! The memory coordinator: the only writer of the record store, both indexes and the graph.
//!
//! Every operation is scoped by owner (and namespace where it applies) and validated before
//! anything is written. Indexing runs on one background worker per coordinator. Store calls
//! queue index jobs; deletes queue a removal job on the same FIFO, so an in-flight reindex can
//! never bring a deleted record back. Index jobs carry the record's `updated_at` and are
//! skipped once a newer write has landed.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MemhubConfig;
use crate::db::{migrations, Db};
use crate::embedding::{chunk_text, truncate_chars, EmbeddingProvider};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::backup::{self, ExportManifest, ExportOptions, ImportReport};
use crate::memory::graph::{GraphStore, InteractionRecord, PatternReport};
use crate::memory::lexical::{Fts5LexicalIndex, LexicalIndex};
use crate::memory::records::{ListFilter, RecordStore};
use crate::memory::search::{HybridEngine, RecallMode, RecallResponse};
use crate::memory::types::{
    normalize_tags, now_timestamp, record_id, record_text, validate_importance, validate_key,
    validate_namespace, validate_owner, validate_query, MemoryRecord, NodeKind, RelatedNode,
    Scope,
};
use crate::memory::vector::{SqliteVectorIndex, VectorIndex};
use crate::memory::IndexEntry;

const EVENT_CAPACITY: usize = 256;

/// Sub-stores touched by a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStore {
    Lexical,
    Vector,
    Record,
}

impl SubStore {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Record => "record",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    Noop,
    PartialFailure,
}

/// A sub-store that failed to remove its entry. The underlying error is logged, never reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubStoreFailure {
    pub store: SubStore,
}

/// Per-sub-store outcome of a delete. Retrying a partial failure is always safe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub record_id: String,
    pub namespace: String,
    pub key: String,
    pub status: DeleteStatus,
    pub succeeded: Vec<SubStore>,
    pub failed: Vec<SubStoreFailure>,
}

impl DeleteReport {
    pub fn summary(&self) -> String {
        let ok: Vec<&str> = self.succeeded.iter().map(|s| s.as_str()).collect();
        let failed: Vec<&str> = self.failed.iter().map(|f| f.store.as_str()).collect();
        format!(
            "record {}: succeeded [{}], failed [{}]",
            self.record_id,
            ok.join(", "),
            failed.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Stored,
    Deleted,
    Feedback,
}

/// Published on every record mutation; sessions forward them as `memory/changed`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEvent {
    pub owner_id: String,
    pub change: ChangeKind,
    pub record_id: String,
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Defaults to `storage.default_namespace`.
    pub namespace: Option<String>,
    pub key: String,
    pub value: serde_json::Value,
    pub tags: Vec<String>,
    /// Defaults to 0.5.
    pub importance: Option<f64>,
    pub scope: Scope,
    /// Also link a `memory_reference` node to the owner's `user` node.
    pub link_graph: bool,
}

impl StoreRequest {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            namespace: None,
            key: key.into(),
            value,
            tags: Vec::new(),
            importance: None,
            scope: Scope::Persistent,
            link_graph: false,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub id: String,
    pub namespace: String,
    pub key: String,
    /// No record existed under this identity before.
    pub created: bool,
    /// `false` when a newer write already held the slot and this one was discarded.
    pub applied: bool,
    /// Timestamp this write carried.
    pub written_at: String,
    /// Timestamp of the record now stored.
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub query: String,
    pub namespace: Option<String>,
    pub k: Option<usize>,
    pub mode: RecallMode,
}

/// `(namespace, key)` address of a record within an owner.
#[derive(Debug, Clone)]
pub struct RecordRef {
    pub namespace: String,
    pub key: String,
}

impl RecordRef {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelateOutcome {
    pub edge_id: String,
    pub from_node: String,
    pub to_node: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedMemory {
    pub record: MemoryRecord,
    pub depth: u32,
    pub relation: String,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct CleanupRequest {
    /// `None` covers every namespace of the owner.
    pub namespace: Option<String>,
    pub max_importance: f64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupCandidate {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<CleanupCandidate>,
    pub deleted: usize,
    pub failures: Vec<DeleteReport>,
}

// ── Background indexer ────────────────────────────────────────────────────────

enum IndexJob {
    Index {
        record_id: String,
        version: String,
    },
    Remove {
        record_id: String,
        reply: oneshot::Sender<RemoveOutcome>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

struct RemoveOutcome {
    lexical: Result<usize, String>,
    vector: Result<usize, String>,
    record: Result<bool, String>,
}

impl RemoveOutcome {
    fn failed(error: String) -> Self {
        Self {
            lexical: Err(error.clone()),
            vector: Err(error.clone()),
            record: Err(error),
        }
    }
}

struct Indexer {
    records: RecordStore,
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_chars: usize,
    chunk_overlap: usize,
}

impl Indexer {
    /// Index the record if it still carries `version`. Returns `false` for a stale job.
    fn index(&self, record_id: &str, version: &str) -> anyhow::Result<bool> {
        let Some(record) = self.records.get_by_id(record_id)? else {
            return Ok(false);
        };
        if record.updated_at != version {
            return Ok(false);
        }

        let entry = IndexEntry {
            record_id: &record.id,
            owner_id: &record.owner_id,
            namespace: &record.namespace,
        };
        let text = record_text(&record.key, &record.value, &record.tags);
        let max_chars = self.embedder.max_input_chars();
        let chunks: Vec<String> = chunk_text(&text, self.chunk_chars, self.chunk_overlap)
            .into_iter()
            .map(|c| truncate_chars(&c, max_chars).to_string())
            .collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let embeddings = self.embedder.embed_batch(&refs)?;

        self.lexical.upsert(&entry, &text)?;
        self.vectors.upsert(&entry, &embeddings)?;
        Ok(true)
    }

    /// Remove the record from every sub-store independently.
    fn remove(&self, record_id: &str) -> RemoveOutcome {
        RemoveOutcome {
            lexical: self.lexical.remove(record_id).map_err(|e| e.to_string()),
            vector: self.vectors.remove(record_id).map_err(|e| e.to_string()),
            record: self.records.delete_by_id(record_id).map_err(|e| e.to_string()),
        }
    }
}

async fn run_indexer(indexer: Arc<Indexer>, mut jobs: mpsc::UnboundedReceiver<IndexJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            IndexJob::Index { record_id, version } => {
                let ix = indexer.clone();
                let id = record_id.clone();
                match tokio::task::spawn_blocking(move || ix.index(&id, &version)).await {
                    Ok(Ok(true)) => debug!(record_id = %record_id, "record indexed"),
                    Ok(Ok(false)) => debug!(record_id = %record_id, "skipped stale index job"),
                    Ok(Err(e)) => warn!(record_id = %record_id, error = %e, "indexing failed"),
                    Err(e) => warn!(record_id = %record_id, error = %e, "indexing task panicked"),
                }
            }
            IndexJob::Remove { record_id, reply } => {
                let ix = indexer.clone();
                let outcome = tokio::task::spawn_blocking(move || ix.remove(&record_id))
                    .await
                    .unwrap_or_else(|e| RemoveOutcome::failed(e.to_string()));
                let _ = reply.send(outcome);
            }
            IndexJob::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!("indexer stopped");
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct MemoryCoordinator {
    db: Db,
    records: RecordStore,
    graph: GraphStore,
    engine: Arc<HybridEngine>,
    vectors: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    default_namespace: String,
    jobs: mpsc::UnboundedSender<IndexJob>,
    events: broadcast::Sender<MemoryEvent>,
}

/// Run synchronous storage work off the async executor.
async fn blocking<T, F>(f: F) -> MemoryResult<T>
where
    F: FnOnce() -> MemoryResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("blocking task failed: {e}")))?
}

impl MemoryCoordinator {
    /// Build a coordinator over SQLite-backed indexes. Must be called inside a Tokio runtime.
    pub fn new(
        db: Db,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &MemhubConfig,
    ) -> anyhow::Result<Self> {
        let vectors: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(db.clone()));
        let lexical: Arc<dyn LexicalIndex> = Arc::new(Fts5LexicalIndex::new(db.clone()));
        Self::with_components(db, vectors, lexical, embedder, config)
    }

    /// Build a coordinator over caller-supplied index implementations.
    pub fn with_components(
        db: Db,
        vectors: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &MemhubConfig,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("the memory coordinator must be created inside a Tokio runtime")?;

        let records = RecordStore::new(db.clone());
        let graph = GraphStore::new(db.clone(), config.graph.clone());
        let engine = Arc::new(HybridEngine::new(
            records.clone(),
            vectors.clone(),
            lexical.clone(),
            embedder.clone(),
            config.retrieval.clone(),
        ));

        let (jobs, rx) = mpsc::unbounded_channel();
        let indexer = Arc::new(Indexer {
            records: records.clone(),
            vectors: vectors.clone(),
            lexical: lexical.clone(),
            embedder: embedder.clone(),
            chunk_chars: config.embedding.chunk_chars,
            chunk_overlap: config.embedding.chunk_overlap,
        });
        runtime.spawn(run_indexer(indexer, rx));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let coordinator = Self {
            db,
            records,
            graph,
            engine,
            vectors,
            lexical,
            embedder,
            default_namespace: config.storage.default_namespace.clone(),
            jobs,
            events,
        };
        coordinator.check_embedding_model()?;
        Ok(coordinator)
    }

    /// Rebuild the vector index when the embedding model changed since it was built.
    fn check_embedding_model(&self) -> anyhow::Result<()> {
        let current = self.embedder.model_id().to_string();
        let stored = {
            let conn = self.db.lock()?;
            migrations::get_embedding_model(&conn)?
        };
        if stored.as_deref() == Some(current.as_str()) {
            return Ok(());
        }

        self.vectors.clear()?;
        {
            let conn = self.db.lock()?;
            migrations::set_embedding_model(&conn, &current)?;
        }
        let versions = self.records.all_versions()?;
        if !versions.is_empty() {
            info!(
                from = stored.as_deref().unwrap_or("none"),
                to = %current,
                records = versions.len(),
                "embedding model changed, rebuilding vector index"
            );
        }
        for (record_id, version) in versions {
            self.enqueue(IndexJob::Index { record_id, version });
        }
        Ok(())
    }

    fn enqueue(&self, job: IndexJob) {
        if self.jobs.send(job).is_err() {
            warn!("indexer is not running; job dropped");
        }
    }

    fn publish(&self, owner: &str, change: ChangeKind, record: &MemoryRecord) {
        // No subscribers is fine.
        let _ = self.events.send(MemoryEvent {
            owner_id: owner.to_string(),
            change,
            record_id: record.id.clone(),
            namespace: record.namespace.clone(),
            key: record.key.clone(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Model identifier the vector index is built with.
    pub fn embedding_model(&self) -> &str {
        self.embedder.model_id()
    }

    /// Resolves once every job queued before this call has been processed.
    pub async fn flush_indexing(&self) -> MemoryResult<()> {
        let (reply, done) = oneshot::channel();
        self.jobs
            .send(IndexJob::Flush { reply })
            .map_err(|_| MemoryError::Internal(anyhow::anyhow!("indexer is not running")))?;
        done.await
            .map_err(|_| MemoryError::Internal(anyhow::anyhow!("indexer stopped while flushing")))
    }

    /// Clear both indexes and queue every record for indexing.
    pub async fn reindex_all(&self) -> MemoryResult<usize> {
        let records = self.records.clone();
        let vectors = self.vectors.clone();
        let lexical = self.lexical.clone();
        let versions = blocking(move || {
            vectors.clear()?;
            lexical.clear()?;
            Ok(records.all_versions()?)
        })
        .await?;
        let count = versions.len();
        for (record_id, version) in versions {
            self.enqueue(IndexJob::Index { record_id, version });
        }
        info!(records = count, "reindex queued");
        Ok(count)
    }

    // ── Records ───────────────────────────────────────────────────────────────

    /// Write a record and queue it for indexing. The record is `get`-able immediately and
    /// becomes recallable once the indexer catches up.
    pub async fn store(&self, owner: &str, req: StoreRequest) -> MemoryResult<StoreOutcome> {
        let namespace = req
            .namespace
            .unwrap_or_else(|| self.default_namespace.clone());
        validate_owner(owner)?;
        validate_namespace(&namespace)?;
        validate_key(&req.key)?;
        let tags = normalize_tags(&req.tags)?;
        let importance = req.importance.unwrap_or(0.5);
        validate_importance(importance)?;

        let now = now_timestamp();
        let record = MemoryRecord {
            id: record_id(owner, &namespace, &req.key),
            owner_id: owner.to_string(),
            namespace,
            key: req.key,
            value: req.value,
            tags,
            importance,
            scope: req.scope,
            access_count: 0,
            feedback_score: 0.0,
            last_accessed: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let records = self.records.clone();
        let (created, applied, stored) = blocking(move || {
            let prior = records.get_by_id(&record.id)?;
            let applied = records.upsert(&record)?;
            let stored = records
                .get_by_id(&record.id)?
                .context("record missing right after upsert")?;
            Ok((prior.is_none(), applied, stored))
        })
        .await?;

        if applied {
            self.enqueue(IndexJob::Index {
                record_id: stored.id.clone(),
                version: stored.updated_at.clone(),
            });
        }
        if req.link_graph {
            self.link_record(owner, &stored).await?;
        }
        self.publish(owner, ChangeKind::Stored, &stored);

        info!(
            owner = %owner,
            namespace = %stored.namespace,
            key = %stored.key,
            record_id = %stored.id,
            created,
            applied,
            "memory stored"
        );

        Ok(StoreOutcome {
            id: stored.id,
            namespace: stored.namespace,
            key: stored.key,
            created,
            applied,
            written_at: now,
            updated_at: stored.updated_at,
        })
    }

    /// Link the record's reference node to the owner's user node.
    async fn link_record(&self, owner: &str, record: &MemoryRecord) -> MemoryResult<()> {
        let graph = self.graph.clone();
        let owner = owner.to_string();
        let record = record.clone();
        blocking(move || {
            let user = graph.add_node(&owner, NodeKind::User, &owner, serde_json::json!({}))?;
            let reference = reference_node(&graph, &owner, &record)?;
            graph.add_edge(&owner, &user, &reference, "remembers", record.importance)?;
            Ok(())
        })
        .await
    }

    pub async fn get(
        &self,
        owner: &str,
        namespace: &str,
        key: &str,
    ) -> MemoryResult<Option<MemoryRecord>> {
        validate_owner(owner)?;
        validate_namespace(namespace)?;
        validate_key(key)?;
        let records = self.records.clone();
        let (owner, namespace, key) = (owner.to_string(), namespace.to_string(), key.to_string());
        blocking(move || Ok(records.get(&owner, &namespace, &key)?)).await
    }

    pub async fn list(&self, owner: &str, filter: ListFilter) -> MemoryResult<Vec<MemoryRecord>> {
        validate_owner(owner)?;
        if let Some(ns) = &filter.namespace {
            validate_namespace(ns)?;
        }
        let records = self.records.clone();
        let owner = owner.to_string();
        blocking(move || Ok(records.list(&owner, &filter)?)).await
    }

    /// Apply a usefulness vote. Unknown records are `not_found`.
    pub async fn feedback(
        &self,
        owner: &str,
        namespace: &str,
        key: &str,
        useful: bool,
    ) -> MemoryResult<MemoryRecord> {
        validate_owner(owner)?;
        validate_namespace(namespace)?;
        validate_key(key)?;
        let records = self.records.clone();
        let (o, n, k) = (owner.to_string(), namespace.to_string(), key.to_string());
        let updated = blocking(move || Ok(records.apply_feedback(&o, &n, &k, useful)?))
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("record {namespace}/{key}")))?;
        self.publish(owner, ChangeKind::Feedback, &updated);
        Ok(updated)
    }

    /// Remove a record from the lexical index, the vector index and the record store.
    ///
    /// Each sub-store is attempted independently. A `deleted` or `noop` report is returned as
    /// `Ok`; if any sub-store fails the report comes back inside
    /// [`MemoryError::PartialFailure`], and calling `delete` again finishes the job.
    pub async fn delete(&self, owner: &str, namespace: &str, key: &str) -> MemoryResult<DeleteReport> {
        validate_owner(owner)?;
        validate_namespace(namespace)?;
        validate_key(key)?;
        let id = record_id(owner, namespace, key);

        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(IndexJob::Remove {
                record_id: id.clone(),
                reply,
            })
            .map_err(|_| MemoryError::Internal(anyhow::anyhow!("indexer is not running")))?;
        let outcome = outcome
            .await
            .map_err(|_| MemoryError::Internal(anyhow::anyhow!("indexer dropped a delete")))?;

        let mut report = DeleteReport {
            record_id: id,
            namespace: namespace.to_string(),
            key: key.to_string(),
            status: DeleteStatus::Noop,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        let mut removed_anything = false;
        let results = [
            (SubStore::Lexical, outcome.lexical.map(|n| n > 0)),
            (SubStore::Vector, outcome.vector.map(|n| n > 0)),
            (SubStore::Record, outcome.record),
        ];
        for (store, result) in results {
            match result {
                Ok(removed) => {
                    removed_anything |= removed;
                    report.succeeded.push(store);
                }
                Err(error) => {
                    warn!(
                        record_id = %report.record_id,
                        store = store.as_str(),
                        error = %error,
                        "sub-store delete failed"
                    );
                    report.failed.push(SubStoreFailure { store });
                }
            }
        }

        if !report.failed.is_empty() {
            report.status = DeleteStatus::PartialFailure;
            warn!(owner = %owner, summary = %report.summary(), "delete partially failed");
            return Err(MemoryError::PartialFailure(report));
        }

        if removed_anything {
            report.status = DeleteStatus::Deleted;
            let _ = self.events.send(MemoryEvent {
                owner_id: owner.to_string(),
                change: ChangeKind::Deleted,
                record_id: report.record_id.clone(),
                namespace: report.namespace.clone(),
                key: report.key.clone(),
            });
        }
        info!(
            owner = %owner,
            namespace = %namespace,
            key = %key,
            status = ?report.status,
            "memory deleted"
        );
        Ok(report)
    }

    // ── Retrieval ─────────────────────────────────────────────────────────────

    pub async fn recall(&self, owner: &str, req: RecallRequest) -> MemoryResult<RecallResponse> {
        validate_owner(owner)?;
        validate_query(&req.query)?;
        if let Some(ns) = &req.namespace {
            validate_namespace(ns)?;
        }
        let engine = self.engine.clone();
        let owner = owner.to_string();
        blocking(move || {
            Ok(engine.recall(&owner, req.namespace.as_deref(), &req.query, req.k, req.mode)?)
        })
        .await
    }

    /// Recall in `ids_only` mode.
    pub async fn search(
        &self,
        owner: &str,
        query: &str,
        namespace: Option<String>,
        k: Option<usize>,
    ) -> MemoryResult<RecallResponse> {
        self.recall(
            owner,
            RecallRequest {
                query: query.to_string(),
                namespace,
                k,
                mode: RecallMode::IdsOnly,
            },
        )
        .await
    }

    // ── Graph ─────────────────────────────────────────────────────────────────

    /// Relate two existing records through their `memory_reference` nodes.
    pub async fn relate(
        &self,
        owner: &str,
        from: RecordRef,
        to: RecordRef,
        relation: &str,
        weight: f64,
    ) -> MemoryResult<RelateOutcome> {
        validate_owner(owner)?;
        for r in [&from, &to] {
            validate_namespace(&r.namespace)?;
            validate_key(&r.key)?;
        }
        crate::memory::types::validate_weight(weight)?;

        let records = self.records.clone();
        let graph = self.graph.clone();
        let owner = owner.to_string();
        let relation = relation.to_string();
        blocking(move || {
            let mut nodes = Vec::with_capacity(2);
            for r in [&from, &to] {
                let record = records
                    .get(&owner, &r.namespace, &r.key)?
                    .ok_or_else(|| MemoryError::NotFound(format!("record {}/{}", r.namespace, r.key)))?;
                nodes.push(reference_node(&graph, &owner, &record)?);
            }
            let edge_id = graph.add_edge(&owner, &nodes[0], &nodes[1], &relation, weight)?;
            Ok(RelateOutcome {
                edge_id,
                from_node: nodes[0].clone(),
                to_node: nodes[1].clone(),
            })
        })
        .await
    }

    /// Records reachable from a record through the graph, nearest first. A record that has
    /// never been related yields nothing.
    pub async fn related_memories(
        &self,
        owner: &str,
        at: RecordRef,
        depth: u32,
        max_nodes: usize,
    ) -> MemoryResult<Vec<RelatedMemory>> {
        validate_owner(owner)?;
        validate_namespace(&at.namespace)?;
        validate_key(&at.key)?;

        let records = self.records.clone();
        let graph = self.graph.clone();
        let owner = owner.to_string();
        blocking(move || {
            let id = record_id(&owner, &at.namespace, &at.key);
            let Some(start) = graph.find_node(&owner, NodeKind::MemoryReference, &id)? else {
                return Ok(Vec::new());
            };
            let related: Vec<RelatedNode> = graph
                .get_related(&owner, &start.id, depth, max_nodes)?
                .into_iter()
                .filter(|r| r.node.kind == NodeKind::MemoryReference)
                .collect();
            let ids: Vec<String> = related.iter().map(|r| r.node.label.clone()).collect();
            let mut found = records.get_many(&owner, &ids)?;
            Ok(related
                .into_iter()
                .filter_map(|r| {
                    found.remove(&r.node.label).map(|record| RelatedMemory {
                        record,
                        depth: r.depth,
                        relation: r.relation,
                        weight: r.weight,
                    })
                })
                .collect())
        })
        .await
    }

    pub async fn add_node(
        &self,
        owner: &str,
        kind: NodeKind,
        label: &str,
        attributes: serde_json::Value,
    ) -> MemoryResult<String> {
        validate_owner(owner)?;
        let graph = self.graph.clone();
        let (owner, label) = (owner.to_string(), label.to_string());
        blocking(move || graph.add_node(&owner, kind, &label, attributes)).await
    }

    pub async fn add_edge(
        &self,
        owner: &str,
        src: &str,
        dst: &str,
        relation: &str,
        weight: f64,
    ) -> MemoryResult<String> {
        validate_owner(owner)?;
        let graph = self.graph.clone();
        let (owner, src, dst, relation) = (
            owner.to_string(),
            src.to_string(),
            dst.to_string(),
            relation.to_string(),
        );
        blocking(move || graph.add_edge(&owner, &src, &dst, &relation, weight)).await
    }

    pub async fn get_related(
        &self,
        owner: &str,
        node: &str,
        depth: u32,
        max_nodes: usize,
    ) -> MemoryResult<Vec<RelatedNode>> {
        validate_owner(owner)?;
        let graph = self.graph.clone();
        let (owner, node) = (owner.to_string(), node.to_string());
        blocking(move || graph.get_related(&owner, &node, depth, max_nodes)).await
    }

    pub async fn record_interaction(
        &self,
        owner: &str,
        query: &str,
        response: &str,
        metadata: serde_json::Value,
    ) -> MemoryResult<InteractionRecord> {
        validate_owner(owner)?;
        let graph = self.graph.clone();
        let (owner, query, response) = (owner.to_string(), query.to_string(), response.to_string());
        blocking(move || graph.record_interaction(&owner, &query, &response, metadata)).await
    }

    pub async fn analyze_pattern(&self, owner: &str) -> MemoryResult<PatternReport> {
        validate_owner(owner)?;
        let graph = self.graph.clone();
        let owner = owner.to_string();
        blocking(move || graph.analyze_pattern(&owner)).await
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Manually remove low-importance records. Each removal is an ordinary delete.
    pub async fn cleanup(&self, owner: &str, req: CleanupRequest) -> MemoryResult<CleanupReport> {
        validate_owner(owner)?;
        validate_importance(req.max_importance)?;
        if let Some(ns) = &req.namespace {
            validate_namespace(ns)?;
        }

        let records = self.records.clone();
        let (o, ns, max) = (owner.to_string(), req.namespace.clone(), req.max_importance);
        let candidates = blocking(move || Ok(records.low_importance(&o, ns.as_deref(), max)?)).await?;

        let mut report = CleanupReport {
            dry_run: req.dry_run,
            candidates: candidates
                .iter()
                .map(|r| CleanupCandidate {
                    id: r.id.clone(),
                    namespace: r.namespace.clone(),
                    key: r.key.clone(),
                    importance: r.importance,
                })
                .collect(),
            deleted: 0,
            failures: Vec::new(),
        };
        if req.dry_run {
            return Ok(report);
        }

        for record in &candidates {
            match self.delete(owner, &record.namespace, &record.key).await {
                Ok(r) if r.status == DeleteStatus::Deleted => report.deleted += 1,
                Ok(_) => {}
                Err(MemoryError::PartialFailure(r)) => report.failures.push(r),
                Err(e) => return Err(e),
            }
        }
        info!(
            owner = %owner,
            candidates = report.candidates.len(),
            deleted = report.deleted,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Write a JSON Lines backup to `writer`.
    pub async fn export<W>(&self, writer: W, opts: ExportOptions) -> MemoryResult<ExportManifest>
    where
        W: Write + Send + 'static,
    {
        if let Some(owner) = &opts.owner {
            validate_owner(owner)?;
        }
        let records = self.records.clone();
        let graph = self.graph.clone();
        blocking(move || {
            let mut writer = writer;
            backup::export(&records, &graph, &mut writer, &opts)
        })
        .await
    }

    /// Restore a JSON Lines backup. The whole stream is validated before anything is
    /// written; imported records are queued for indexing.
    pub async fn import<R>(&self, reader: R) -> MemoryResult<ImportReport>
    where
        R: BufRead + Send + 'static,
    {
        let records = self.records.clone();
        let graph = self.graph.clone();
        let (report, written) = blocking(move || backup::import(&records, &graph, reader)).await?;
        for (record_id, version) in written {
            self.enqueue(IndexJob::Index { record_id, version });
        }
        Ok(report)
    }
}

/// The record's `memory_reference` node, created on first use.
fn reference_node(graph: &GraphStore, owner: &str, record: &MemoryRecord) -> MemoryResult<String> {
    graph.add_node(
        owner,
        NodeKind::MemoryReference,
        &record.id,
        serde_json::json!({"namespace": record.namespace, "key": record.key}),
    )
}
