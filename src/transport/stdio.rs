//! Trusted stdio transport: one local session, one JSON frame per line.
//!
//! Requests are handled strictly in order. Responses and event frames share a single writer
//! task so lines never interleave.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::permissions::TrustContext;
use crate::protocol::session::{SessionManager, TerminationReason};

fn encode<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            None
        }
    }
}

/// Serve one local session over `reader`/`writer` until EOF or termination.
pub async fn run<R, W>(manager: Arc<SessionManager>, owner: &str, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = manager.create_session(TrustContext::Local, owner);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = out_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut events = manager.attach_events(&session)?;
    let event_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = encode(&event) {
                if event_tx.send(line).is_err() {
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = manager.handle_text(&session, &line).await {
            if let Some(encoded) = encode(&response) {
                if out_tx.send(encoded).is_err() {
                    break;
                }
            }
        }
        if session.is_terminated() {
            debug!(session = %session.id, "session ended, closing stdio loop");
            break;
        }
    }

    manager.terminate(&session.id, TerminationReason::StreamClosed);
    drop(out_tx);
    if let Err(e) = forwarder.await {
        warn!(error = %e, "event forwarder failed");
    }
    match writer_task.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "stdio writer failed"),
    }
    info!(session = %session.id, "stdio session closed");
    Ok(())
}

/// Serve the process's own stdin/stdout.
pub async fn serve(manager: Arc<SessionManager>, owner: &str) -> Result<()> {
    run(manager, owner, tokio::io::stdin(), tokio::io::stdout()).await
}
