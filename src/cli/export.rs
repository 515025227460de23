use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::config::MemhubConfig;
use crate::memory::backup::ExportOptions;

/// Write a JSON Lines backup to `output`, or stdout when `None`.
pub async fn export(
    config: &MemhubConfig,
    output: Option<&Path>,
    owner: Option<String>,
    include_ephemeral: bool,
) -> Result<()> {
    let coordinator = super::open_coordinator(config)?;
    let opts = ExportOptions {
        owner,
        include_ephemeral,
    };

    let manifest = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            coordinator.export(BufWriter::new(file), opts).await?
        }
        None => coordinator.export(std::io::stdout(), opts).await?,
    };

    eprintln!(
        "Exported {} records, {} graph nodes and {} graph edges.",
        manifest.records, manifest.nodes, manifest.edges
    );
    Ok(())
}
