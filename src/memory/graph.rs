//! Relationship graph: typed nodes, append-only weighted edges, bounded traversal,
//! interaction recording and pattern aggregation.
//!
//! Edges are never updated or deleted (SQLite triggers enforce it). The effective edge for a
//! `(src, dst, relation)` triple is the most recently appended one, and an effective weight of
//! zero retracts the relation for traversal while keeping its history.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::config::GraphConfig;
use crate::db::Db;
use crate::embedding::truncate_chars;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::types::{
    now_timestamp, validate_weight, GraphEdge, GraphNode, NodeKind, RelatedNode,
};

pub const MAX_LABEL_CHARS: usize = 256;
pub const MAX_RELATION_CHARS: usize = 64;

const RESPONSE_PREVIEW_CHARS: usize = 200;
const INTERACTION_LABEL_CHARS: usize = 80;

const NODE_COLUMNS: &str = "id, owner_id, kind, label, attributes, created_at";

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "also", "been", "before", "being", "could", "does",
    "doing", "each", "from", "have", "having", "help", "here", "into", "just", "know", "like",
    "more", "most", "need", "only", "other", "over", "please", "same", "should", "some",
    "such", "tell", "than", "thanks", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "very", "want", "were", "what", "when", "where",
    "which", "while", "will", "with", "would", "your", "yours",
];

/// Result of [`GraphStore::record_interaction`].
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRecord {
    pub interaction_id: String,
    pub user_node_id: String,
    pub topics: Vec<String>,
    pub memory_refs: Vec<String>,
    pub platform: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrajectoryPoint {
    pub at: String,
    pub topics: Vec<String>,
}

/// Aggregate view of an owner's recorded interactions.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatternReport {
    pub total_interactions: usize,
    pub topics: BTreeMap<String, usize>,
    pub platforms: BTreeMap<String, usize>,
    pub trajectory: Vec<TrajectoryPoint>,
    /// Topics in the order they first appeared.
    pub first_seen_topics: Vec<String>,
}

#[derive(Clone)]
pub struct GraphStore {
    db: Db,
    config: GraphConfig,
}

impl GraphStore {
    pub fn new(db: Db, config: GraphConfig) -> Self {
        Self { db, config }
    }

    /// Create a node, or return the existing one with the same `(owner, kind, label)`.
    /// Interaction nodes are always new.
    pub fn add_node(
        &self,
        owner: &str,
        kind: NodeKind,
        label: &str,
        attributes: serde_json::Value,
    ) -> MemoryResult<String> {
        check_label(label)?;
        let attributes = object_or_empty(attributes)?;
        let conn = self.db.lock()?;
        Ok(upsert_node(&conn, owner, kind, label, &attributes)?)
    }

    /// Append an edge. Both endpoints must exist and belong to `owner`.
    pub fn add_edge(
        &self,
        owner: &str,
        src: &str,
        dst: &str,
        relation: &str,
        weight: f64,
    ) -> MemoryResult<String> {
        validate_weight(weight)?;
        check_relation(relation)?;
        let conn = self.db.lock()?;
        for node in [src, dst] {
            if !node_exists(&conn, owner, node)? {
                return Err(MemoryError::NotFound(format!("graph node {node}")));
            }
        }
        Ok(append_edge(&conn, owner, src, dst, relation, weight)?)
    }

    pub fn get_node(&self, owner: &str, id: &str) -> MemoryResult<Option<GraphNode>> {
        let conn = self.db.read()?;
        Ok(load_node(&conn, owner, id)?)
    }

    pub fn find_node(
        &self,
        owner: &str,
        kind: NodeKind,
        label: &str,
    ) -> MemoryResult<Option<GraphNode>> {
        let conn = self.db.read()?;
        let node = conn
            .query_row(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM graph_nodes \
                     WHERE owner_id = ?1 AND kind = ?2 AND label = ?3 \
                     ORDER BY created_at LIMIT 1"
                ),
                params![owner, kind.as_str(), label],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// Breadth-first walk over effective edges in both directions.
    ///
    /// Neighbours are visited strongest first, then most recent first. Stops at `depth`
    /// hops or `max_nodes` results, whichever comes first; both are capped by config. The
    /// start node is not part of the result, and a missing start node yields nothing.
    pub fn get_related(
        &self,
        owner: &str,
        start: &str,
        depth: u32,
        max_nodes: usize,
    ) -> MemoryResult<Vec<RelatedNode>> {
        let depth = depth.min(self.config.max_depth);
        let max_nodes = max_nodes.min(self.config.max_nodes);
        let conn = self.db.read()?;

        if depth == 0 || max_nodes == 0 || !node_exists(&conn, owner, start)? {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut queue = VecDeque::from([(start.to_string(), 0u32)]);
        let mut related = Vec::new();

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for (neighbour, relation, weight) in effective_neighbours(&conn, owner, &current)? {
                if !visited.insert(neighbour.clone()) {
                    continue;
                }
                let Some(node) = load_node(&conn, owner, &neighbour)? else {
                    continue;
                };
                related.push(RelatedNode {
                    node,
                    depth: hops + 1,
                    relation,
                    weight,
                });
                if related.len() >= max_nodes {
                    return Ok(related);
                }
                queue.push_back((neighbour, hops + 1));
            }
        }

        Ok(related)
    }

    /// Record one query/response exchange and link it to its user, topics and memories.
    ///
    /// `metadata.topics` (strings) overrides keyword extraction, `metadata.memory_ids` adds
    /// `references` edges, `metadata.platform` labels the client. Other metadata keys are
    /// kept on the interaction node.
    pub fn record_interaction(
        &self,
        owner: &str,
        query: &str,
        response: &str,
        metadata: serde_json::Value,
    ) -> MemoryResult<InteractionRecord> {
        crate::memory::types::validate_query(query)?;
        let mut metadata = object_or_empty(metadata)?;
        let meta = metadata
            .as_object_mut()
            .ok_or_else(|| MemoryError::validation("metadata must be an object"))?;

        let platform = match meta.remove("platform") {
            Some(serde_json::Value::String(p)) if !p.trim().is_empty() => p,
            _ => "unknown".to_string(),
        };
        let topics = match meta.remove("topics") {
            Some(serde_json::Value::Array(items)) => explicit_topics(&items),
            _ => extract_topics(query, self.config.max_topics),
        };
        let memory_refs: Vec<String> = match meta.remove("memory_ids") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        for label in topics.iter().chain(memory_refs.iter()) {
            check_label(label)?;
        }

        let attributes = serde_json::json!({
            "query": query,
            "response_preview": truncate_chars(response, RESPONSE_PREVIEW_CHARS),
            "platform": platform,
            "metadata": metadata,
        });

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let user_node_id = upsert_node(&tx, owner, NodeKind::User, owner, &serde_json::json!({}))?;
        let label = truncate_chars(query.trim(), INTERACTION_LABEL_CHARS);
        let interaction_id = upsert_node(&tx, owner, NodeKind::Interaction, label, &attributes)?;
        append_edge(&tx, owner, &user_node_id, &interaction_id, "initiated", 1.0)?;

        for topic in &topics {
            let topic_id = upsert_node(&tx, owner, NodeKind::Topic, topic, &serde_json::json!({}))?;
            append_edge(&tx, owner, &interaction_id, &topic_id, "about", 1.0)?;
        }
        for memory_id in &memory_refs {
            let ref_id = upsert_node(
                &tx,
                owner,
                NodeKind::MemoryReference,
                memory_id,
                &serde_json::json!({}),
            )?;
            append_edge(&tx, owner, &interaction_id, &ref_id, "references", 1.0)?;
        }

        let created_at: String = tx.query_row(
            "SELECT created_at FROM graph_nodes WHERE id = ?1",
            params![interaction_id],
            |r| r.get(0),
        )?;
        tx.commit()?;

        tracing::debug!(
            owner = %owner,
            interaction = %interaction_id,
            topics = topics.len(),
            "interaction recorded"
        );

        Ok(InteractionRecord {
            interaction_id,
            user_node_id,
            topics,
            memory_refs,
            platform,
            created_at,
        })
    }

    /// Topic and platform histograms plus the chronological topic trajectory.
    pub fn analyze_pattern(&self, owner: &str) -> MemoryResult<PatternReport> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(
            "SELECT id, attributes, created_at FROM graph_nodes \
             WHERE owner_id = ?1 AND kind = 'interaction' ORDER BY created_at, rowid",
        )?;
        let interactions = stmt
            .query_map(params![owner], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut topic_stmt = conn.prepare(
            "SELECT t.label FROM graph_edges e JOIN graph_nodes t ON t.id = e.dst \
             WHERE e.src = ?1 AND e.relation = 'about' AND t.kind = 'topic' ORDER BY e.seq",
        )?;

        let mut report = PatternReport {
            total_interactions: interactions.len(),
            topics: BTreeMap::new(),
            platforms: BTreeMap::new(),
            trajectory: Vec::with_capacity(interactions.len()),
            first_seen_topics: Vec::new(),
        };

        for (id, attributes, created_at) in interactions {
            let platform = serde_json::from_str::<serde_json::Value>(&attributes)
                .ok()
                .and_then(|a| a.get("platform").and_then(|p| p.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *report.platforms.entry(platform).or_insert(0) += 1;

            let topics = topic_stmt
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for topic in &topics {
                let count = report.topics.entry(topic.clone()).or_insert(0);
                if *count == 0 {
                    report.first_seen_topics.push(topic.clone());
                }
                *count += 1;
            }
            report.trajectory.push(TrajectoryPoint {
                at: created_at,
                topics,
            });
        }

        Ok(report)
    }

    /// Nodes for backup, optionally restricted to one owner.
    pub fn export_nodes(&self, owner: Option<&str>) -> MemoryResult<Vec<GraphNode>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM graph_nodes \
             WHERE ?1 IS NULL OR owner_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let nodes = stmt
            .query_map(params![owner], row_to_node)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// Edges for backup in append order.
    pub fn export_edges(&self, owner: Option<&str>) -> MemoryResult<Vec<GraphEdge>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, src, dst, relation, weight, created_at FROM graph_edges \
             WHERE ?1 IS NULL OR owner_id = ?1 ORDER BY seq",
        )?;
        let edges = stmt
            .query_map(params![owner], |row| {
                Ok(GraphEdge {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    src: row.get(2)?,
                    dst: row.get(3)?,
                    relation: row.get(4)?,
                    weight: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// Restore a backed-up node. Returns the id the node has in this store: an existing node
    /// with the same identity (or the same id) wins over the backed-up id.
    pub fn import_node(&self, node: &GraphNode) -> MemoryResult<(String, bool)> {
        let conn = self.db.lock()?;
        if node.kind != NodeKind::Interaction {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM graph_nodes WHERE owner_id = ?1 AND kind = ?2 AND label = ?3",
                    params![node.owner_id, node.kind.as_str(), node.label],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }
        }
        if node_exists(&conn, &node.owner_id, &node.id)? {
            return Ok((node.id.clone(), false));
        }
        conn.execute(
            "INSERT INTO graph_nodes (id, owner_id, kind, label, attributes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                node.id,
                node.owner_id,
                node.kind.as_str(),
                node.label,
                node.attributes.to_string(),
                node.created_at,
            ],
        )?;
        Ok((node.id.clone(), true))
    }

    /// Restore a backed-up edge whose endpoints are already remapped. Returns `false` if an
    /// edge with the same id is already present.
    pub fn import_edge(&self, edge: &GraphEdge) -> MemoryResult<bool> {
        let conn = self.db.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM graph_edges WHERE id = ?1)",
            params![edge.id],
            |r| r.get(0),
        )?;
        if exists {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO graph_edges (id, owner_id, src, dst, relation, weight, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.id,
                edge.owner_id,
                edge.src,
                edge.dst,
                edge.relation,
                edge.weight,
                edge.created_at,
            ],
        )?;
        Ok(true)
    }
}

/// Keyword topics: lowercase alphanumeric tokens of at least four chars, minus stop words,
/// most frequent first with ties broken by first occurrence.
pub fn extract_topics(query: &str, max_topics: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let lowered = query.to_lowercase();
    for (position, token) in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 4 && !STOP_WORDS.contains(t))
        .enumerate()
    {
        counts.entry(token.to_string()).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(max_topics)
        .map(|(topic, _)| topic)
        .collect()
}

fn explicit_topics(items: &[serde_json::Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn check_label(label: &str) -> MemoryResult<()> {
    let len = label.chars().count();
    if len == 0 || len > MAX_LABEL_CHARS || label.chars().any(char::is_control) {
        return Err(MemoryError::validation(format!(
            "node label must be 1-{MAX_LABEL_CHARS} characters without control characters"
        )));
    }
    Ok(())
}

fn check_relation(relation: &str) -> MemoryResult<()> {
    let len = relation.trim().chars().count();
    if len == 0 || len > MAX_RELATION_CHARS {
        return Err(MemoryError::validation(format!(
            "relation must be 1-{MAX_RELATION_CHARS} characters"
        )));
    }
    Ok(())
}

fn object_or_empty(value: serde_json::Value) -> MemoryResult<serde_json::Value> {
    match value {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        v @ serde_json::Value::Object(_) => Ok(v),
        _ => Err(MemoryError::validation("attributes must be a JSON object")),
    }
}

fn node_exists(conn: &Connection, owner: &str, id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM graph_nodes WHERE id = ?1 AND owner_id = ?2)",
        params![id, owner],
        |r| r.get(0),
    )
}

fn load_node(conn: &Connection, owner: &str, id: &str) -> rusqlite::Result<Option<GraphNode>> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM graph_nodes WHERE id = ?1 AND owner_id = ?2"),
        params![id, owner],
        row_to_node,
    )
    .optional()
}

fn upsert_node(
    conn: &Connection,
    owner: &str,
    kind: NodeKind,
    label: &str,
    attributes: &serde_json::Value,
) -> rusqlite::Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    let attributes = attributes.to_string();
    let now = now_timestamp();

    if kind == NodeKind::Interaction {
        conn.execute(
            "INSERT INTO graph_nodes (id, owner_id, kind, label, attributes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, owner, kind.as_str(), label, attributes, now],
        )?;
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO graph_nodes (id, owner_id, kind, label, attributes, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT DO NOTHING",
        params![id, owner, kind.as_str(), label, attributes, now],
    )?;
    conn.query_row(
        "SELECT id FROM graph_nodes WHERE owner_id = ?1 AND kind = ?2 AND label = ?3",
        params![owner, kind.as_str(), label],
        |r| r.get(0),
    )
}

fn append_edge(
    conn: &Connection,
    owner: &str,
    src: &str,
    dst: &str,
    relation: &str,
    weight: f64,
) -> rusqlite::Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO graph_edges (id, owner_id, src, dst, relation, weight, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, owner, src, dst, relation.trim(), weight, now_timestamp()],
    )?;
    Ok(id)
}

/// `(other_end, relation, weight)` for every live effective edge touching `node`,
/// strongest first, then most recently appended first.
fn effective_neighbours(
    conn: &Connection,
    owner: &str,
    node: &str,
) -> rusqlite::Result<Vec<(String, String, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT CASE WHEN e.src = ?2 THEN e.dst ELSE e.src END, e.relation, e.weight \
         FROM graph_edges e \
         WHERE e.owner_id = ?1 AND (e.src = ?2 OR e.dst = ?2) \
           AND e.seq = (SELECT MAX(l.seq) FROM graph_edges l \
                        WHERE l.src = e.src AND l.dst = e.dst AND l.relation = e.relation) \
           AND e.weight > 0 \
         ORDER BY e.weight DESC, e.seq DESC",
    )?;
    let rows = stmt
        .query_map(params![owner, node], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<GraphNode> {
    let kind: String = row.get(2)?;
    let attributes: String = row.get(4)?;
    Ok(GraphNode {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::other(e)),
            )
        })?,
        label: row.get(3)?,
        attributes: serde_json::from_str(&attributes).unwrap_or_else(|_| serde_json::json!({})),
        created_at: row.get(5)?,
    })
}
