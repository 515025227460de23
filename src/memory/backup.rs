//! JSON Lines backup format.
//!
//! The first line is a header; every following line is one tagged element:
//!
//! ```text
//! {"type":"header","format":"memhub-backup","version":1,"exported_at":"..."}
//! {"type":"memory_record","id":"...","owner_id":"u1","namespace":"shared",...}
//! {"type":"graph_node","id":"...","kind":"topic","label":"rust",...}
//! {"type":"graph_edge","id":"...","src":"...","dst":"...","relation":"about",...}
//! ```
//!
//! Import parses and validates the whole stream before writing anything.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::graph::GraphStore;
use crate::memory::records::RecordStore;
use crate::memory::types::{
    normalize_tags, now_timestamp, record_id, validate_importance, validate_key,
    validate_namespace, validate_owner, validate_weight, GraphEdge, GraphNode, MemoryRecord,
};

pub const BACKUP_FORMAT: &str = "memhub-backup";
pub const BACKUP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BackupLine {
    Header {
        format: String,
        version: u32,
        exported_at: String,
    },
    MemoryRecord(MemoryRecord),
    GraphNode(GraphNode),
    GraphEdge(GraphEdge),
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Restrict the backup to one owner. `None` exports everything.
    pub owner: Option<String>,
    /// Ephemeral-scope records are skipped unless set.
    pub include_ephemeral: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub exported_at: String,
    pub records: usize,
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub records: usize,
    pub nodes: usize,
    pub edges: usize,
}

fn write_line(writer: &mut dyn Write, line: &BackupLine) -> MemoryResult<()> {
    let json = serde_json::to_string(line)
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("failed to encode backup line: {e}")))?;
    writeln!(writer, "{json}").map_err(|e| MemoryError::Transport(format!("backup write failed: {e}")))
}

pub fn export(
    records: &RecordStore,
    graph: &GraphStore,
    writer: &mut dyn Write,
    opts: &ExportOptions,
) -> MemoryResult<ExportManifest> {
    let exported_at = now_timestamp();
    let owner = opts.owner.as_deref();

    let all_records = records.all_records(owner, opts.include_ephemeral)?;
    let nodes = graph.export_nodes(owner)?;
    let edges = graph.export_edges(owner)?;

    write_line(
        writer,
        &BackupLine::Header {
            format: BACKUP_FORMAT.to_string(),
            version: BACKUP_VERSION,
            exported_at: exported_at.clone(),
        },
    )?;
    let manifest = ExportManifest {
        exported_at,
        records: all_records.len(),
        nodes: nodes.len(),
        edges: edges.len(),
    };
    for record in all_records {
        write_line(writer, &BackupLine::MemoryRecord(record))?;
    }
    for node in nodes {
        write_line(writer, &BackupLine::GraphNode(node))?;
    }
    for edge in edges {
        write_line(writer, &BackupLine::GraphEdge(edge))?;
    }
    writer
        .flush()
        .map_err(|e| MemoryError::Transport(format!("backup flush failed: {e}")))?;

    tracing::info!(
        records = manifest.records,
        nodes = manifest.nodes,
        edges = manifest.edges,
        "backup exported"
    );
    Ok(manifest)
}

struct ParsedBackup {
    records: Vec<MemoryRecord>,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

fn invalid(line_no: usize, msg: impl std::fmt::Display) -> MemoryError {
    MemoryError::validation(format!("backup line {line_no}: {msg}"))
}

fn parse(reader: impl BufRead) -> MemoryResult<ParsedBackup> {
    let mut parsed = ParsedBackup {
        records: Vec::new(),
        nodes: Vec::new(),
        edges: Vec::new(),
    };
    let mut saw_header = false;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| MemoryError::Transport(format!("backup read failed: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let element: BackupLine = serde_json::from_str(&line).map_err(|e| invalid(line_no, e))?;

        match element {
            BackupLine::Header { format, version, .. } => {
                if saw_header {
                    return Err(invalid(line_no, "duplicate header"));
                }
                if format != BACKUP_FORMAT {
                    return Err(invalid(line_no, format!("unknown format '{format}'")));
                }
                if version > BACKUP_VERSION {
                    return Err(invalid(line_no, format!("unsupported version {version}")));
                }
                saw_header = true;
            }
            _ if !saw_header => return Err(invalid(line_no, "missing header")),
            BackupLine::MemoryRecord(mut record) => {
                validate_owner(&record.owner_id).map_err(|e| invalid(line_no, e))?;
                validate_namespace(&record.namespace).map_err(|e| invalid(line_no, e))?;
                validate_key(&record.key).map_err(|e| invalid(line_no, e))?;
                validate_importance(record.importance).map_err(|e| invalid(line_no, e))?;
                record.tags = normalize_tags(&record.tags).map_err(|e| invalid(line_no, e))?;
                if record.id != record_id(&record.owner_id, &record.namespace, &record.key) {
                    return Err(invalid(line_no, "record id does not match its owner/namespace/key"));
                }
                parsed.records.push(record);
            }
            BackupLine::GraphNode(node) => {
                validate_owner(&node.owner_id).map_err(|e| invalid(line_no, e))?;
                if node.label.is_empty() || !node.attributes.is_object() {
                    return Err(invalid(line_no, "graph node needs a label and object attributes"));
                }
                parsed.nodes.push(node);
            }
            BackupLine::GraphEdge(edge) => {
                validate_weight(edge.weight).map_err(|e| invalid(line_no, e))?;
                if edge.relation.trim().is_empty() {
                    return Err(invalid(line_no, "graph edge needs a relation"));
                }
                parsed.edges.push(edge);
            }
        }
    }

    if !saw_header {
        return Err(MemoryError::validation("backup is empty or has no header"));
    }

    let node_owners: HashMap<&str, &str> = parsed
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.owner_id.as_str()))
        .collect();
    let mut seen_edges = HashSet::new();
    for edge in &parsed.edges {
        for end in [&edge.src, &edge.dst] {
            match node_owners.get(end.as_str()) {
                Some(owner) if *owner == edge.owner_id => {}
                _ => {
                    return Err(MemoryError::validation(format!(
                        "backup edge {} references node {end} that is not in the backup",
                        edge.id
                    )))
                }
            }
        }
        if !seen_edges.insert(edge.id.as_str()) {
            return Err(MemoryError::validation(format!("duplicate backup edge {}", edge.id)));
        }
    }

    Ok(parsed)
}

/// Validate and restore a backup. Returns the counts written and the `(id, updated_at)` of
/// every record written so the caller can index them.
pub fn import(
    records: &RecordStore,
    graph: &GraphStore,
    reader: impl BufRead,
) -> MemoryResult<(ImportReport, Vec<(String, String)>)> {
    let parsed = parse(reader)?;
    let mut report = ImportReport::default();
    let mut written = Vec::new();

    for record in &parsed.records {
        if records.upsert(record)? {
            report.records += 1;
            written.push((record.id.clone(), record.updated_at.clone()));
        }
    }

    let mut remap: HashMap<String, String> = HashMap::with_capacity(parsed.nodes.len());
    for node in &parsed.nodes {
        let (id, created) = graph.import_node(node)?;
        if created {
            report.nodes += 1;
        }
        remap.insert(node.id.clone(), id);
    }

    for edge in parsed.edges {
        let (Some(src), Some(dst)) = (remap.get(&edge.src), remap.get(&edge.dst)) else {
            continue;
        };
        let edge = GraphEdge {
            src: src.clone(),
            dst: dst.clone(),
            ..edge
        };
        if graph.import_edge(&edge)? {
            report.edges += 1;
        }
    }

    tracing::info!(
        records = report.records,
        nodes = report.nodes,
        edges = report.edges,
        "backup imported"
    );
    Ok((report, written))
}
