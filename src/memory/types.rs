//! Core memory type definitions and input validation.
//!
//! Defines [`MemoryRecord`] (one scoped key-value record), [`Scope`], the graph types
//! ([`NodeKind`], [`GraphNode`], [`GraphEdge`], [`RelatedNode`]), deterministic record ids,
//! and the validation rules every write passes before touching storage.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, MemoryResult};

/// Reserved namespace visible to every session of an owner.
pub const SHARED_NAMESPACE: &str = "shared";

pub const MAX_OWNER_CHARS: usize = 128;
pub const MAX_NAMESPACE_CHARS: usize = 64;
pub const MAX_KEY_CHARS: usize = 256;
pub const MAX_TAGS: usize = 32;
pub const MAX_TAG_CHARS: usize = 64;

/// Retention hint for a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Kept and exported.
    #[default]
    Persistent,
    /// Kept, but left out of backups unless explicitly requested.
    Ephemeral,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(Self::Persistent),
            "ephemeral" => Ok(Self::Ephemeral),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// A stored record, matching the `records` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Derived from `(owner_id, namespace, key)`; see [`record_id`].
    pub id: String,
    pub owner_id: String,
    pub namespace: String,
    pub key: String,
    /// Opaque JSON value supplied by the client.
    pub value: serde_json::Value,
    /// Sorted, de-duplicated.
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f64,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub feedback_score: f64,
    #[serde(default)]
    pub last_accessed: Option<String>,
    /// RFC 3339, microsecond precision, UTC.
    pub created_at: String,
    pub updated_at: String,
}

/// Deterministic record id: first 32 hex chars of SHA-256 over `owner \0 namespace \0 key`.
pub fn record_id(owner: &str, namespace: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_bytes());
    hasher.update([0u8]);
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(32);
    id
}

/// Current time as a lexicographically sortable RFC 3339 timestamp.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Text fed to the lexical and vector indexes for a record.
///
/// The key (`_` and `-` read as spaces), every scalar leaf of the value, and the tags.
pub fn record_text(key: &str, value: &serde_json::Value, tags: &[String]) -> String {
    let mut parts = vec![key.replace(['_', '-'], " ")];
    collect_leaves(value, &mut parts);
    parts.extend(tags.iter().cloned());
    parts.retain(|p| !p.trim().is_empty());
    parts.join(" ")
}

fn collect_leaves(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Bool(b) => out.push(b.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
        serde_json::Value::Null => {}
    }
}

/// Node categories in the relationship graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    User,
    Topic,
    /// Weak back-reference to a record id.
    MemoryReference,
    /// Always a fresh node; never de-duplicated.
    Interaction,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Topic => "topic",
            Self::MemoryReference => "memory_reference",
            Self::Interaction => "interaction",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "topic" => Ok(Self::Topic),
            "memory_reference" => Ok(Self::MemoryReference),
            "interaction" => Ok(Self::Interaction),
            _ => Err(format!("unknown node kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub owner_id: String,
    pub kind: NodeKind,
    pub label: String,
    /// Always a JSON object.
    pub attributes: serde_json::Value,
    pub created_at: String,
}

/// One appended edge. The latest edge for `(src, dst, relation)` is the effective one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub owner_id: String,
    pub src: String,
    pub dst: String,
    pub relation: String,
    pub weight: f64,
    pub created_at: String,
}

/// A node reached by traversal.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedNode {
    pub node: GraphNode,
    /// Hops from the start node (1 = direct neighbour).
    pub depth: u32,
    /// Relation of the edge the node was first reached through.
    pub relation: String,
    /// Effective weight of that edge.
    pub weight: f64,
}

// ── Validation ────────────────────────────────────────────────────────────────

fn check_text(field: &str, value: &str, max_chars: usize) -> MemoryResult<()> {
    let len = value.chars().count();
    if len == 0 || len > max_chars {
        return Err(MemoryError::validation(format!(
            "{field} must be 1-{max_chars} characters"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(MemoryError::validation(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

pub fn validate_owner(owner: &str) -> MemoryResult<()> {
    check_text("owner_id", owner, MAX_OWNER_CHARS)
}

pub fn validate_namespace(namespace: &str) -> MemoryResult<()> {
    let len = namespace.chars().count();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-');
    if len == 0 || len > MAX_NAMESPACE_CHARS || !namespace.chars().all(allowed) {
        return Err(MemoryError::validation(format!(
            "namespace must be 1-{MAX_NAMESPACE_CHARS} characters of [A-Za-z0-9_.:-]"
        )));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> MemoryResult<()> {
    check_text("key", key, MAX_KEY_CHARS)
}

/// Trim, sort and de-duplicate tags, then check their limits.
pub fn normalize_tags(tags: &[String]) -> MemoryResult<Vec<String>> {
    let mut tags: Vec<String> = tags.iter().map(|t| t.trim().to_string()).collect();
    tags.sort();
    tags.dedup();
    if tags.len() > MAX_TAGS {
        return Err(MemoryError::validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    for tag in &tags {
        check_text("tag", tag, MAX_TAG_CHARS)?;
    }
    Ok(tags)
}

fn check_unit_interval(field: &str, value: f64) -> MemoryResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::validation(format!(
            "{field} must be between 0.0 and 1.0"
        )));
    }
    Ok(())
}

pub fn validate_importance(importance: f64) -> MemoryResult<()> {
    check_unit_interval("importance", importance)
}

pub fn validate_weight(weight: f64) -> MemoryResult<()> {
    check_unit_interval("weight", weight)
}

pub fn validate_query(query: &str) -> MemoryResult<()> {
    if query.trim().is_empty() {
        return Err(MemoryError::validation("query must not be empty"));
    }
    Ok(())
}
