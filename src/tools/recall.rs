use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{capability, to_json, CallContext, CapabilityRegistry};
use crate::error::MemoryResult;
use crate::memory::coordinator::RecallRequest;
use crate::memory::search::RecallMode;

pub fn register(registry: &mut CapabilityRegistry) -> anyhow::Result<()> {
    registry.register(Arc::new(MemoryRecall))?;
    registry.register(Arc::new(MemorySearch))?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecallParams {
    #[schemars(description = "Natural language query")]
    pub query: String,

    #[schemars(description = "Restrict to this namespace (the shared namespace is always included)")]
    pub namespace: Option<String>,

    #[schemars(description = "Maximum results. Defaults to 5.")]
    pub k: Option<usize>,

    #[schemars(description = "'full' (default) returns records; 'ids_only' returns ids with a short preview")]
    pub mode: Option<RecallMode>,
}

async fn recall(ctx: &CallContext, params: RecallParams) -> MemoryResult<Value> {
    let req = RecallRequest {
        query: params.query,
        namespace: params.namespace,
        k: params.k,
        mode: params.mode.unwrap_or_default(),
    };
    let response = ctx.coordinator.recall(&ctx.owner, req).await?;
    to_json(&response)
}

capability!(
    MemoryRecall,
    "memory_recall",
    RecallParams,
    remote_safe = true,
    "Find records by meaning and keywords. Results are ranked by a fused semantic and lexical score.",
    recall
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    #[schemars(description = "Natural language query")]
    pub query: String,

    #[schemars(description = "Restrict to this namespace (the shared namespace is always included)")]
    pub namespace: Option<String>,

    #[schemars(description = "Maximum results. Defaults to 5.")]
    pub k: Option<usize>,
}

async fn search(ctx: &CallContext, params: SearchParams) -> MemoryResult<Value> {
    let response = ctx
        .coordinator
        .search(&ctx.owner, &params.query, params.namespace, params.k)
        .await?;
    to_json(&response)
}

capability!(
    MemorySearch,
    "memory_search",
    SearchParams,
    remote_safe = true,
    "Like memory_recall but returns only ids, locations, previews and scores.",
    search
);
