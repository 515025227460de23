//! Shared memory backend for AI agents.
//!
//! memhub keeps scoped key-value records for many owners and lets agents find them again by
//! meaning and keywords, relate them in a graph, and share them across sessions. Clients
//! talk to it over two transports with different trust levels.
//!
//! | Transport | Trust | Owner | Capabilities |
//! |-----------|-------|-------|--------------|
//! | **stdio** | local | `server.local_owner` | all |
//! | **HTTP + SSE** | remote | bearer credential, else `server.anonymous_owner` | remote allow-list only |
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions), or a
//!   deterministic hashed provider for offline use
//! - **Recall**: weighted fusion of cosine similarity and normalized BM25
//! - **Graph**: append-only weighted edges between users, topics, interactions and records
//! - **Indexing**: one background worker per coordinator; records are readable at once and
//!   recallable once indexed
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite database initialization, schema and migrations
//! - [`embedding`]: Text-to-vector embedding providers
//! - [`memory`]: Record store, indexes, hybrid recall, graph, coordinator and backups
//! - [`protocol`]: Wire frames, permission filter, credentials and sessions
//! - [`tools`]: Capability registry
//! - [`transport`]: stdio and HTTP + SSE transports
//! - [`server`]: Server wiring

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transport;
