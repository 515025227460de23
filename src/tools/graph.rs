//! Graph capabilities: record relations, raw node/edge access, interactions and patterns.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{capability, to_json, CallContext, CapabilityRegistry};
use crate::error::MemoryResult;
use crate::memory::coordinator::RecordRef;
use crate::memory::types::NodeKind;

const DEFAULT_DEPTH: u32 = 2;
const DEFAULT_MAX_NODES: usize = 50;

pub fn register(registry: &mut CapabilityRegistry) -> anyhow::Result<()> {
    registry.register(Arc::new(MemoryRelate))?;
    registry.register(Arc::new(MemoryRelated))?;
    registry.register(Arc::new(GraphAddNode))?;
    registry.register(Arc::new(GraphAddEdge))?;
    registry.register(Arc::new(GraphRelated))?;
    registry.register(Arc::new(InteractionRecordCap))?;
    registry.register(Arc::new(PatternAnalyze))?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecordLocator {
    #[schemars(description = "Namespace. Defaults to the shared namespace.")]
    pub namespace: Option<String>,

    #[schemars(description = "Record key")]
    pub key: String,
}

impl RecordLocator {
    fn resolve(self, ctx: &CallContext) -> RecordRef {
        let namespace = self
            .namespace
            .unwrap_or_else(|| ctx.coordinator.default_namespace().to_string());
        RecordRef::new(namespace, self.key)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RelateParams {
    #[schemars(description = "Source record")]
    pub from: RecordLocator,

    #[schemars(description = "Target record")]
    pub to: RecordLocator,

    #[schemars(description = "Relation name, e.g. 'supports', 'contradicts', 'follows'")]
    pub relation: String,

    #[schemars(description = "Weight 0.0-1.0. Defaults to 1.0; 0.0 retracts the relation.")]
    pub weight: Option<f64>,
}

async fn relate(ctx: &CallContext, params: RelateParams) -> MemoryResult<Value> {
    let from = params.from.resolve(ctx);
    let to = params.to.resolve(ctx);
    let outcome = ctx
        .coordinator
        .relate(
            &ctx.owner,
            from,
            to,
            &params.relation,
            params.weight.unwrap_or(1.0),
        )
        .await?;
    to_json(&outcome)
}

capability!(
    MemoryRelate,
    "memory_relate",
    RelateParams,
    remote_safe = true,
    "Relate two existing records in the graph. Relating again appends a new edge; the latest weight wins.",
    relate
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RelatedMemoriesParams {
    #[schemars(description = "Namespace of the starting record. Defaults to the shared namespace.")]
    pub namespace: Option<String>,

    #[schemars(description = "Key of the starting record")]
    pub key: String,

    #[schemars(description = "Maximum hops. Defaults to 2.")]
    pub depth: Option<u32>,

    #[schemars(description = "Maximum results. Defaults to 50.")]
    pub max_nodes: Option<usize>,
}

async fn related_memories(ctx: &CallContext, params: RelatedMemoriesParams) -> MemoryResult<Value> {
    let at = RecordLocator {
        namespace: params.namespace,
        key: params.key,
    }
    .resolve(ctx);
    let related = ctx
        .coordinator
        .related_memories(
            &ctx.owner,
            at,
            params.depth.unwrap_or(DEFAULT_DEPTH),
            params.max_nodes.unwrap_or(DEFAULT_MAX_NODES),
        )
        .await?;
    Ok(json!({ "count": related.len(), "results": related }))
}

capability!(
    MemoryRelated,
    "memory_related",
    RelatedMemoriesParams,
    remote_safe = true,
    "Records connected to a record through the graph, nearest first.",
    related_memories
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddNodeParams {
    #[schemars(description = "'user', 'topic', 'memory_reference' or 'interaction'")]
    pub kind: NodeKind,

    #[schemars(description = "Node label. Non-interaction nodes are unique per kind and label.")]
    pub label: String,

    #[schemars(description = "Optional JSON object of attributes")]
    pub attributes: Option<Value>,
}

async fn add_node(ctx: &CallContext, params: AddNodeParams) -> MemoryResult<Value> {
    let attributes = params.attributes.unwrap_or_else(|| json!({}));
    let id = ctx
        .coordinator
        .add_node(&ctx.owner, params.kind, &params.label, attributes)
        .await?;
    Ok(json!({ "id": id }))
}

capability!(
    GraphAddNode,
    "graph_add_node",
    AddNodeParams,
    remote_safe = true,
    "Add a graph node, or return the existing one with the same kind and label.",
    add_node
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddEdgeParams {
    #[schemars(description = "Source node id")]
    pub src: String,

    #[schemars(description = "Destination node id")]
    pub dst: String,

    #[schemars(description = "Relation name")]
    pub relation: String,

    #[schemars(description = "Weight 0.0-1.0. Defaults to 1.0.")]
    pub weight: Option<f64>,
}

async fn add_edge(ctx: &CallContext, params: AddEdgeParams) -> MemoryResult<Value> {
    let id = ctx
        .coordinator
        .add_edge(
            &ctx.owner,
            &params.src,
            &params.dst,
            &params.relation,
            params.weight.unwrap_or(1.0),
        )
        .await?;
    Ok(json!({ "id": id }))
}

capability!(
    GraphAddEdge,
    "graph_add_edge",
    AddEdgeParams,
    remote_safe = true,
    "Append a weighted edge between two of your nodes.",
    add_edge
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphRelatedParams {
    #[schemars(description = "Starting node id")]
    pub node: String,

    #[schemars(description = "Maximum hops. Defaults to 2.")]
    pub depth: Option<u32>,

    #[schemars(description = "Maximum results. Defaults to 50.")]
    pub max_nodes: Option<usize>,
}

async fn graph_related(ctx: &CallContext, params: GraphRelatedParams) -> MemoryResult<Value> {
    let related = ctx
        .coordinator
        .get_related(
            &ctx.owner,
            &params.node,
            params.depth.unwrap_or(DEFAULT_DEPTH),
            params.max_nodes.unwrap_or(DEFAULT_MAX_NODES),
        )
        .await?;
    Ok(json!({ "count": related.len(), "results": related }))
}

capability!(
    GraphRelated,
    "graph_related",
    GraphRelatedParams,
    remote_safe = true,
    "Breadth-first neighbours of a node over current edges, strongest first.",
    graph_related
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InteractionParams {
    #[schemars(description = "What the user asked")]
    pub query: String,

    #[schemars(description = "What was answered")]
    pub response: String,

    #[schemars(
        description = "Optional metadata: 'platform', 'topics' (overrides keyword extraction), 'memory_ids' (records referenced)"
    )]
    pub metadata: Option<Value>,
}

async fn interaction(ctx: &CallContext, params: InteractionParams) -> MemoryResult<Value> {
    let recorded = ctx
        .coordinator
        .record_interaction(
            &ctx.owner,
            &params.query,
            &params.response,
            params.metadata.unwrap_or_else(|| json!({})),
        )
        .await?;
    to_json(&recorded)
}

capability!(
    InteractionRecordCap,
    "interaction_record",
    InteractionParams,
    remote_safe = true,
    "Record a query/response interaction and link it to its topics and referenced records.",
    interaction
);

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct PatternParams {}

async fn pattern(ctx: &CallContext, _params: PatternParams) -> MemoryResult<Value> {
    let report = ctx.coordinator.analyze_pattern(&ctx.owner).await?;
    to_json(&report)
}

capability!(
    PatternAnalyze,
    "pattern_analyze",
    PatternParams,
    remote_safe = true,
    "Summarize recorded interactions: topic and platform histograms and a learning trajectory.",
    pattern
);
