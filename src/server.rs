//! Server initialization for the stdio and HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that wire the database, the
//! embedding provider, the memory coordinator and the capability registry into a running
//! session manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::MemhubConfig;
use crate::db::Db;
use crate::embedding;
use crate::memory::coordinator::MemoryCoordinator;
use crate::protocol::auth::SqliteCredentialStore;
use crate::protocol::session::SessionManager;
use crate::tools::CapabilityRegistry;
use crate::transport::{http, stdio};

/// How often the idle reaper looks for expired remote sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a running server shares across sessions.
pub struct ServerContext {
    pub db: Db,
    pub coordinator: Arc<MemoryCoordinator>,
    pub manager: Arc<SessionManager>,
}

/// Open the database, build the embedding provider and coordinator, and register the
/// built-in capabilities. Must run inside a Tokio runtime.
pub fn setup(config: &MemhubConfig) -> Result<ServerContext> {
    let db_path = config.resolved_db_path();
    let db = Db::open(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let provider = embedding::create_provider(&config.embedding)?;
    let embedder: Arc<dyn embedding::EmbeddingProvider> = Arc::from(provider);
    tracing::info!(model = %embedder.model_id(), "embedding provider ready");

    with_db(db, embedder, config)
}

/// Like [`setup`] over an already-open database and provider.
pub fn with_db(
    db: Db,
    embedder: Arc<dyn embedding::EmbeddingProvider>,
    config: &MemhubConfig,
) -> Result<ServerContext> {
    let coordinator = Arc::new(MemoryCoordinator::new(db.clone(), embedder, config)?);
    let registry = Arc::new(CapabilityRegistry::builtin().context("capability registry")?);
    tracing::info!(capabilities = registry.len(), "capability registry ready");
    let manager = Arc::new(SessionManager::new(
        coordinator.clone(),
        registry,
        &config.server,
    ));
    Ok(ServerContext {
        db,
        coordinator,
        manager,
    })
}

/// Start the server on the transport named by `server.transport`.
pub async fn serve(config: MemhubConfig) -> Result<()> {
    match config.server.transport.as_str() {
        "stdio" => serve_stdio(config).await,
        "http" => serve_http(config).await,
        other => anyhow::bail!("unknown transport: {other}. Supported: stdio, http"),
    }
}

/// Serve one trusted session over this process's stdin/stdout.
pub async fn serve_stdio(config: MemhubConfig) -> Result<()> {
    tracing::info!("starting memhub on stdio");
    let ctx = setup(&config)?;
    stdio::serve(ctx.manager.clone(), &config.server.local_owner).await?;
    ctx.coordinator.flush_indexing().await?;
    tracing::info!("stdio server shut down");
    Ok(())
}

/// Serve untrusted sessions over HTTP + SSE until ctrl-c.
pub async fn serve_http(config: MemhubConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting memhub on HTTP");

    let ctx = setup(&config)?;
    let stop = CancellationToken::new();
    let reaper = ctx.manager.spawn_reaper(REAP_INTERVAL, stop.clone());

    let state = http::HttpState {
        manager: ctx.manager.clone(),
        credentials: Arc::new(SqliteCredentialStore::new(ctx.db.clone())),
        anonymous_owner: config.server.anonymous_owner.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let shutdown = stop.clone();
    let manager = ctx.manager.clone();
    http::serve(listener, state, async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
            }
            _ = shutdown.cancelled() => {}
        }
        tracing::info!("shutting down http server");
        // Open event streams would otherwise hold the graceful shutdown open.
        manager.shutdown();
    })
    .await?;

    stop.cancel();
    let _ = reaper.await;
    ctx.coordinator.flush_indexing().await?;
    Ok(())
}
