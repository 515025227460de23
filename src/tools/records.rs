//! Record capabilities: `memory_store`, `memory_get`, `memory_list`, `memory_delete`,
//! `memory_feedback`.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{capability, to_json, CallContext, CapabilityRegistry};
use crate::error::MemoryResult;
use crate::memory::coordinator::StoreRequest;
use crate::memory::records::ListFilter;
use crate::memory::types::Scope;

pub fn register(registry: &mut CapabilityRegistry) -> anyhow::Result<()> {
    registry.register(Arc::new(MemoryStore))?;
    registry.register(Arc::new(MemoryGet))?;
    registry.register(Arc::new(MemoryList))?;
    registry.register(Arc::new(MemoryDelete))?;
    registry.register(Arc::new(MemoryFeedback))?;
    Ok(())
}

fn namespace_or_default(ctx: &CallContext, namespace: Option<String>) -> String {
    namespace.unwrap_or_else(|| ctx.coordinator.default_namespace().to_string())
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StoreParams {
    #[schemars(description = "Namespace to write into. Defaults to the shared namespace.")]
    pub namespace: Option<String>,

    #[schemars(description = "Key, unique within the namespace. Writing an existing key overwrites it.")]
    pub key: String,

    #[schemars(description = "Any JSON value")]
    pub value: Value,

    #[schemars(description = "Optional tags (max 32)")]
    pub tags: Option<Vec<String>>,

    #[schemars(description = "Importance 0.0-1.0. Defaults to 0.5.")]
    pub importance: Option<f64>,

    #[schemars(description = "'persistent' (default) or 'ephemeral' (left out of backups)")]
    pub scope: Option<Scope>,

    #[schemars(description = "Also link this record into the relationship graph under your user node")]
    pub link_graph: Option<bool>,
}

async fn store(ctx: &CallContext, params: StoreParams) -> MemoryResult<Value> {
    let req = StoreRequest {
        namespace: params.namespace,
        key: params.key,
        value: params.value,
        tags: params.tags.unwrap_or_default(),
        importance: params.importance,
        scope: params.scope.unwrap_or_default(),
        link_graph: params.link_graph.unwrap_or(false),
    };
    let outcome = ctx.coordinator.store(&ctx.owner, req).await?;
    to_json(&outcome)
}

capability!(
    MemoryStore,
    "memory_store",
    StoreParams,
    remote_safe = true,
    "Store a JSON value under (namespace, key). Overwrites an existing key; the write with the later timestamp wins.",
    store
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LocateParams {
    #[schemars(description = "Namespace. Defaults to the shared namespace.")]
    pub namespace: Option<String>,

    #[schemars(description = "Record key")]
    pub key: String,
}

async fn get(ctx: &CallContext, params: LocateParams) -> MemoryResult<Value> {
    let namespace = namespace_or_default(ctx, params.namespace);
    let record = ctx
        .coordinator
        .get(&ctx.owner, &namespace, &params.key)
        .await?;
    Ok(json!({ "record": record }))
}

capability!(
    MemoryGet,
    "memory_get",
    LocateParams,
    remote_safe = true,
    "Fetch one record by namespace and key. Returns null when absent.",
    get
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListParams {
    #[schemars(description = "Only this namespace. Omit for all namespaces.")]
    pub namespace: Option<String>,

    #[schemars(description = "Only records carrying this tag")]
    pub tag: Option<String>,

    #[schemars(description = "Only keys starting with this prefix")]
    pub key_prefix: Option<String>,

    #[schemars(description = "Only records with at least this importance")]
    pub min_importance: Option<f64>,

    #[schemars(description = "Page size. Defaults to 100.")]
    pub limit: Option<usize>,

    #[schemars(description = "Records to skip")]
    pub offset: Option<usize>,
}

async fn list(ctx: &CallContext, params: ListParams) -> MemoryResult<Value> {
    let defaults = ListFilter::default();
    let filter = ListFilter {
        namespace: params.namespace,
        tag: params.tag,
        key_prefix: params.key_prefix,
        min_importance: params.min_importance,
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(0),
    };
    let records = ctx.coordinator.list(&ctx.owner, filter).await?;
    Ok(json!({ "count": records.len(), "records": records }))
}

capability!(
    MemoryList,
    "memory_list",
    ListParams,
    remote_safe = true,
    "List records, most recently updated first.",
    list
);

async fn delete(ctx: &CallContext, params: LocateParams) -> MemoryResult<Value> {
    let namespace = namespace_or_default(ctx, params.namespace);
    let report = ctx
        .coordinator
        .delete(&ctx.owner, &namespace, &params.key)
        .await?;
    to_json(&report)
}

capability!(
    MemoryDelete,
    "memory_delete",
    LocateParams,
    remote_safe = true,
    "Delete a record and its index entries. Deleting a missing record is a no-op; a partial failure is safe to retry.",
    delete
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct FeedbackParams {
    #[schemars(description = "Namespace. Defaults to the shared namespace.")]
    pub namespace: Option<String>,

    #[schemars(description = "Record key")]
    pub key: String,

    #[schemars(description = "Whether the record was useful")]
    pub useful: bool,
}

async fn feedback(ctx: &CallContext, params: FeedbackParams) -> MemoryResult<Value> {
    let namespace = namespace_or_default(ctx, params.namespace);
    let record = ctx
        .coordinator
        .feedback(&ctx.owner, &namespace, &params.key, params.useful)
        .await?;
    Ok(json!({
        "id": record.id,
        "feedback_score": record.feedback_score,
        "importance": record.importance,
    }))
}

capability!(
    MemoryFeedback,
    "memory_feedback",
    FeedbackParams,
    remote_safe = true,
    "Vote on a record's usefulness. Nudges its importance up or down.",
    feedback
);
