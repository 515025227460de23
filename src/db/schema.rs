//! SQL DDL for all memhub tables.
//!
//! Defines `records`, `records_fts` (FTS5), `record_vectors`, `graph_nodes`,
//! `graph_edges` (append-only via triggers), `api_keys`, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for memhub's core tables.
const SCHEMA_SQL: &str = r#"
-- Record store: one row per (owner, namespace, key)
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    scope TEXT NOT NULL DEFAULT 'persistent' CHECK(scope IN ('persistent','ephemeral')),
    access_count INTEGER NOT NULL DEFAULT 0,
    feedback_score REAL NOT NULL DEFAULT 0.0,
    last_accessed TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(owner_id, namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_records_owner_ns ON records(owner_id, namespace);
CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at);

-- Lexical index (BM25). Standalone table so rows can be removed by record_id.
CREATE VIRTUAL TABLE IF NOT EXISTS records_fts USING fts5(
    content,
    record_id UNINDEXED,
    owner_id UNINDEXED,
    namespace UNINDEXED,
    tokenize = 'porter unicode61'
);

-- Vector index: one row per content chunk, scored with vec_distance_cosine
CREATE TABLE IF NOT EXISTS record_vectors (
    chunk_id TEXT PRIMARY KEY,
    record_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vectors_record ON record_vectors(record_id);
CREATE INDEX IF NOT EXISTS idx_vectors_owner_ns ON record_vectors(owner_id, namespace);

-- Relationship graph
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('user','topic','memory_reference','interaction')),
    label TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_identity
    ON graph_nodes(owner_id, kind, label) WHERE kind != 'interaction';
CREATE INDEX IF NOT EXISTS idx_nodes_owner_kind ON graph_nodes(owner_id, kind, created_at);

CREATE TABLE IF NOT EXISTS graph_edges (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    owner_id TEXT NOT NULL,
    src TEXT NOT NULL REFERENCES graph_nodes(id),
    dst TEXT NOT NULL REFERENCES graph_nodes(id),
    relation TEXT NOT NULL,
    weight REAL NOT NULL CHECK(weight >= 0.0 AND weight <= 1.0),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_src ON graph_edges(src);
CREATE INDEX IF NOT EXISTS idx_edges_dst ON graph_edges(dst);
CREATE INDEX IF NOT EXISTS idx_edges_owner ON graph_edges(owner_id);

CREATE TRIGGER IF NOT EXISTS graph_edges_no_update
BEFORE UPDATE ON graph_edges
BEGIN
    SELECT RAISE(ABORT, 'graph edges are append-only');
END;

CREATE TRIGGER IF NOT EXISTS graph_edges_no_delete
BEFORE DELETE ON graph_edges
BEGIN
    SELECT RAISE(ABORT, 'graph edges are append-only');
END;

-- Bearer credentials, written by the admin dashboard; the server only reads them
CREATE TABLE IF NOT EXISTS api_keys (
    key_hash TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    label TEXT,
    created_at TEXT NOT NULL,
    revoked_at TEXT
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
