#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use memhub::config::MemhubConfig;
use memhub::db::Db;
use memhub::embedding::hashed::HashedEmbeddingProvider;
use memhub::embedding::EmbeddingProvider;
use memhub::error::MemoryResult;
use memhub::memory::coordinator::{MemoryCoordinator, StoreRequest, StoreOutcome};
use memhub::memory::lexical::{Fts5LexicalIndex, LexicalIndex};
use memhub::memory::vector::{SqliteVectorIndex, VectorIndex};
use memhub::memory::IndexEntry;
use memhub::protocol::permissions::TrustContext;
use memhub::protocol::session::{Session, SessionManager};
use memhub::protocol::{RequestFrame, ResponseFrame};
use memhub::tools::{CallContext, Capability, CapabilityRegistry};
use serde_json::{json, Value};

/// Defaults with the hashed embedding provider, so no model files are needed.
pub fn test_config() -> MemhubConfig {
    let mut config = MemhubConfig::default();
    config.embedding.provider = "hashed".into();
    config
}

/// Fresh coordinator over a private in-memory database. Call inside a Tokio runtime.
pub fn coordinator() -> Arc<MemoryCoordinator> {
    coordinator_with(Arc::new(HashedEmbeddingProvider::default()))
}

pub fn coordinator_with(embedder: Arc<dyn EmbeddingProvider>) -> Arc<MemoryCoordinator> {
    let db = Db::open_in_memory().unwrap();
    Arc::new(MemoryCoordinator::new(db, embedder, &test_config()).unwrap())
}

pub async fn store(
    coordinator: &MemoryCoordinator,
    owner: &str,
    namespace: &str,
    key: &str,
    value: Value,
) -> StoreOutcome {
    coordinator
        .store(owner, StoreRequest::new(key, value).in_namespace(namespace))
        .await
        .unwrap()
}

/// Hashed embeddings, except that any text containing `gate` blocks until [`open`] is
/// called. Lets a test hold the indexer in the middle of a job.
///
/// [`open`]: GatedEmbedder::open
pub struct GatedEmbedder {
    inner: HashedEmbeddingProvider,
    gate: String,
    open: Mutex<bool>,
    opened: Condvar,
    blocked: AtomicUsize,
}

impl GatedEmbedder {
    pub fn new(gate: &str) -> Self {
        Self {
            inner: HashedEmbeddingProvider::default(),
            gate: gate.to_string(),
            open: Mutex::new(false),
            opened: Condvar::new(),
            blocked: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    /// Number of embed calls that have hit the gate so far.
    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for GatedEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if text.contains(&self.gate) {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
        }
        self.inner.embed(text)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn max_input_chars(&self) -> usize {
        self.inner.max_input_chars()
    }
}

/// SQLite vector index whose `remove` fails while `fail_remove` is set.
pub struct FailingVectorIndex {
    inner: SqliteVectorIndex,
    pub fail_remove: AtomicBool,
}

impl FailingVectorIndex {
    pub fn new(db: Db) -> Self {
        Self {
            inner: SqliteVectorIndex::new(db),
            fail_remove: AtomicBool::new(false),
        }
    }
}

impl VectorIndex for FailingVectorIndex {
    fn upsert(&self, entry: &IndexEntry<'_>, chunks: &[Vec<f32>]) -> anyhow::Result<()> {
        self.inner.upsert(entry, chunks)
    }

    fn remove(&self, record_id: &str) -> anyhow::Result<usize> {
        if self.fail_remove.load(Ordering::SeqCst) {
            anyhow::bail!("vector index unavailable");
        }
        self.inner.remove(record_id)
    }

    fn search(
        &self,
        owner: &str,
        namespaces: Option<&[String]>,
        query: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        self.inner.search(owner, namespaces, query, limit)
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.inner.clear()
    }

    fn len(&self) -> anyhow::Result<usize> {
        self.inner.len()
    }
}

/// Coordinator whose vector index can be made to fail on remove.
pub fn coordinator_with_failing_vectors() -> (Arc<MemoryCoordinator>, Arc<FailingVectorIndex>) {
    let db = Db::open_in_memory().unwrap();
    let vectors = Arc::new(FailingVectorIndex::new(db.clone()));
    let lexical: Arc<dyn LexicalIndex> = Arc::new(Fts5LexicalIndex::new(db.clone()));
    let coordinator = MemoryCoordinator::with_components(
        db,
        vectors.clone(),
        lexical,
        Arc::new(HashedEmbeddingProvider::default()),
        &test_config(),
    )
    .unwrap();
    (Arc::new(coordinator), vectors)
}

/// Remote-safe external tool that runs until its call is cancelled.
pub struct SlowSearch {
    pub started: AtomicBool,
    pub cancelled: Arc<AtomicBool>,
}

impl SlowSearch {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Capability for SlowSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Never finishes on its own"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn remote_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &CallContext, _args: Value) -> MemoryResult<Value> {
        self.started.store(true, Ordering::SeqCst);
        ctx.cancel.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

pub fn manager_with(
    coordinator: Arc<MemoryCoordinator>,
    registry: CapabilityRegistry,
    config: &MemhubConfig,
) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        coordinator,
        Arc::new(registry),
        &config.server,
    ))
}

pub fn manager() -> Arc<SessionManager> {
    manager_with(
        coordinator(),
        CapabilityRegistry::builtin().unwrap(),
        &test_config(),
    )
}

pub async fn open_session(
    manager: &SessionManager,
    trust: TrustContext,
    owner: &str,
) -> Arc<Session> {
    let session = manager.create_session(trust, owner);
    let resp = manager
        .handle(&session, RequestFrame::new(0, "initialize", json!({})))
        .await
        .unwrap();
    assert!(!resp.is_error(), "initialize failed: {resp:?}");
    session
}

pub async fn call(
    manager: &SessionManager,
    session: &Arc<Session>,
    name: &str,
    arguments: Value,
) -> ResponseFrame {
    manager
        .handle(
            session,
            RequestFrame::new(
                1,
                "capabilities/call",
                json!({"name": name, "arguments": arguments}),
            ),
        )
        .await
        .unwrap()
}

/// Result of a successful call.
pub async fn call_ok(
    manager: &SessionManager,
    session: &Arc<Session>,
    name: &str,
    arguments: Value,
) -> Value {
    let resp = call(manager, session, name, arguments).await;
    assert!(!resp.is_error(), "{name} failed: {:?}", resp.error);
    resp.result.unwrap()
}
