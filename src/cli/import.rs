use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::MemhubConfig;

/// Restore a JSON Lines backup and wait for the imported records to be indexed.
pub async fn import(config: &MemhubConfig, file: &Path) -> Result<()> {
    let reader = File::open(file)
        .with_context(|| format!("failed to read import file: {}", file.display()))?;

    let coordinator = super::open_coordinator(config)?;
    let report = coordinator.import(BufReader::new(reader)).await?;

    println!("Indexing {} records...", report.records);
    coordinator.flush_indexing().await?;

    println!(
        "Imported {} records, {} graph nodes and {} graph edges.",
        report.records, report.nodes, report.edges
    );
    Ok(())
}
