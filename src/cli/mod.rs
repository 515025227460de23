pub mod export;
pub mod import;
pub mod keys;

use anyhow::{Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::config::MemhubConfig;
use crate::db::Db;
use crate::memory::coordinator::MemoryCoordinator;

const MODEL_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx";
const TOKENIZER_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json";

/// Open the configured database with a coordinator over it, for one-shot commands.
pub(crate) fn open_coordinator(config: &MemhubConfig) -> Result<MemoryCoordinator> {
    let db = Db::open(config.resolved_db_path())?;
    let provider = crate::embedding::create_provider(&config.embedding)?;
    MemoryCoordinator::new(db, Arc::from(provider), config)
}

/// Fetch the ONNX model and tokenizer into `embedding.cache_dir`, skipping files already
/// present.
pub async fn model_download(config: &crate::config::EmbeddingConfig) -> Result<()> {
    use crate::embedding::local::{MODEL_FILE, TOKENIZER_FILE};

    let cache_dir = crate::config::expand_tilde(&config.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    for (url, file) in [(MODEL_URL, MODEL_FILE), (TOKENIZER_URL, TOKENIZER_FILE)] {
        let dest = cache_dir.join(file);
        if dest.exists() {
            println!("{file}: already present at {}", dest.display());
            continue;
        }
        println!("{file}: downloading...");
        download_file(url, &dest).await?;
        println!("{file}: saved to {}", dest.display());
    }

    println!("Embedding model ready.");
    Ok(())
}

/// Stream `url` into `dest` through a `.part` file, with a progress bar.
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let progress = match response.content_length() {
        Some(size) => {
            let style = ProgressStyle::default_bar()
                .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                .context("invalid progress template")?
                .progress_chars("##-");
            ProgressBar::new(size).with_style(style)
        }
        None => ProgressBar::new_spinner(),
    };

    let partial = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("error reading response")?;
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        progress.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("failed to move {} into place", partial.display()))?;

    progress.finish_and_clear();
    Ok(())
}
