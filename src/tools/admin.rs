//! Local-only administration: backup export/import and manual cleanup.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{capability, to_json, CallContext, CapabilityRegistry};
use crate::config::expand_tilde;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::backup::ExportOptions;
use crate::memory::coordinator::CleanupRequest;

const DEFAULT_CLEANUP_IMPORTANCE: f64 = 0.1;

pub fn register(registry: &mut CapabilityRegistry) -> anyhow::Result<()> {
    registry.register(Arc::new(MemoryExport))?;
    registry.register(Arc::new(MemoryImport))?;
    registry.register(Arc::new(MemoryCleanup))?;
    Ok(())
}

/// In-memory sink the blocking export can own while we keep a handle to the bytes.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn into_string(self) -> MemoryResult<String> {
        let bytes = self
            .0
            .lock()
            .map_err(|e| MemoryError::Internal(anyhow::anyhow!("export buffer poisoned: {e}")))?
            .clone();
        String::from_utf8(bytes)
            .map_err(|e| MemoryError::Internal(anyhow::anyhow!("export is not UTF-8: {e}")))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("export buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExportParams {
    #[schemars(description = "Write the backup to this file. Omit to return it inline as 'data'.")]
    pub path: Option<String>,

    #[schemars(description = "Export every owner in the database, not just your own records")]
    pub all_owners: Option<bool>,

    #[schemars(description = "Include ephemeral-scope records")]
    pub include_ephemeral: Option<bool>,
}

async fn export(ctx: &CallContext, params: ExportParams) -> MemoryResult<Value> {
    let opts = ExportOptions {
        owner: if params.all_owners.unwrap_or(false) {
            None
        } else {
            Some(ctx.owner.clone())
        },
        include_ephemeral: params.include_ephemeral.unwrap_or(false),
    };

    match params.path {
        Some(path) => {
            let path = expand_tilde(&path);
            let file = File::create(&path).map_err(|e| {
                MemoryError::validation(format!("cannot create {}: {e}", path.display()))
            })?;
            let manifest = ctx.coordinator.export(BufWriter::new(file), opts).await?;
            Ok(json!({ "manifest": manifest, "path": path.display().to_string() }))
        }
        None => {
            let buffer = SharedBuffer::default();
            let manifest = ctx.coordinator.export(buffer.clone(), opts).await?;
            Ok(json!({ "manifest": manifest, "data": buffer.into_string()? }))
        }
    }
}

capability!(
    MemoryExport,
    "memory_export",
    ExportParams,
    remote_safe = false,
    "Export records and graph as a JSON Lines backup.",
    export
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ImportParams {
    #[schemars(description = "Backup file to read")]
    pub path: Option<String>,

    #[schemars(description = "Inline JSON Lines backup, as returned by memory_export")]
    pub data: Option<String>,
}

async fn import(ctx: &CallContext, params: ImportParams) -> MemoryResult<Value> {
    let report = match (params.path, params.data) {
        (Some(path), None) => {
            let path = expand_tilde(&path);
            let file = File::open(&path)
                .map_err(|e| MemoryError::NotFound(format!("{}: {e}", path.display())))?;
            ctx.coordinator.import(BufReader::new(file)).await?
        }
        (None, Some(data)) => ctx.coordinator.import(Cursor::new(data.into_bytes())).await?,
        _ => {
            return Err(MemoryError::validation(
                "exactly one of 'path' or 'data' is required",
            ))
        }
    };
    to_json(&report)
}

capability!(
    MemoryImport,
    "memory_import",
    ImportParams,
    remote_safe = false,
    "Restore a JSON Lines backup. The whole backup is validated before anything is written.",
    import
);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CleanupParams {
    #[schemars(description = "Only this namespace. Omit for all namespaces.")]
    pub namespace: Option<String>,

    #[schemars(description = "Delete records with importance at or below this. Defaults to 0.1.")]
    pub max_importance: Option<f64>,

    #[schemars(description = "Only report candidates. Defaults to true.")]
    pub dry_run: Option<bool>,
}

async fn cleanup(ctx: &CallContext, params: CleanupParams) -> MemoryResult<Value> {
    let req = CleanupRequest {
        namespace: params.namespace,
        max_importance: params.max_importance.unwrap_or(DEFAULT_CLEANUP_IMPORTANCE),
        dry_run: params.dry_run.unwrap_or(true),
    };
    let report = ctx.coordinator.cleanup(&ctx.owner, req).await?;
    to_json(&report)
}

capability!(
    MemoryCleanup,
    "memory_cleanup",
    CleanupParams,
    remote_safe = false,
    "Delete low-importance records. Runs as a dry run unless dry_run is false.",
    cleanup
);
