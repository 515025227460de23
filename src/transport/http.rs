//! Untrusted HTTP transport.
//!
//! - `POST /rpc` carries one request frame. `initialize` without an `x-session-id` header
//!   opens a session; every later request names it in that header.
//! - `GET /events` streams the session's event frames as SSE. Closing the stream terminates
//!   the session and cancels its in-flight calls.
//! - `DELETE /rpc` terminates the session.
//! - `GET /health` reports liveness.
//!
//! A bearer credential in `Authorization` resolves the owner; no credential means the
//! anonymous owner. A request's owner must match its session's owner.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::MemoryError;
use crate::protocol::auth::{fingerprint, CredentialStore};
use crate::protocol::permissions::TrustContext;
use crate::protocol::session::{Session, SessionManager, TerminationReason};
use crate::protocol::{parse_request, EventFrame, Method, ResponseFrame};

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<SessionManager>,
    pub credentials: Arc<dyn CredentialStore>,
    pub anonymous_owner: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/rpc", post(post_rpc).delete(delete_rpc))
        .route("/events", get(get_events))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: HttpState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "http transport listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, err: &MemoryError) -> Response {
    (status, Json(ResponseFrame::failure(None, err))).into_response()
}

fn status_for(err: &MemoryError) -> StatusCode {
    match err {
        MemoryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        MemoryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn resolve_owner(state: &HttpState, headers: &HeaderMap) -> Result<String, MemoryError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(state.anonymous_owner.clone());
    };
    let credential = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MemoryError::Unauthorized("expected 'Authorization: Bearer <key>'".into()))?
        .to_string();

    let store = state.credentials.clone();
    let lookup = credential.clone();
    let owner = tokio::task::spawn_blocking(move || store.resolve(&lookup))
        .await
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("credential lookup failed: {e}")))?
        .map_err(MemoryError::Internal)?;
    match owner {
        Some(owner) => Ok(owner),
        None => {
            warn!(key = %fingerprint(&credential), "unknown credential");
            Err(MemoryError::Unauthorized("unknown credential".into()))
        }
    }
}

/// The session named by `x-session-id`, owned by `owner`.
fn existing_session(
    state: &HttpState,
    headers: &HeaderMap,
    owner: &str,
) -> Result<Arc<Session>, MemoryError> {
    let id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MemoryError::InvalidRequest(format!("missing {SESSION_HEADER} header")))?;
    let session = state
        .manager
        .get(id)
        .ok_or_else(|| MemoryError::NotFound(format!("session '{id}'")))?;
    if session.owner != owner {
        warn!(session = %id, "credential does not match session owner");
        return Err(MemoryError::Unauthorized(
            "credential does not match the session owner".into(),
        ));
    }
    Ok(session)
}

async fn post_rpc(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    let owner = match resolve_owner(&state, &headers).await {
        Ok(owner) => owner,
        Err(e) => return error_response(status_for(&e), &e),
    };

    let has_session = headers.contains_key(SESSION_HEADER);
    let session = if has_session {
        match existing_session(&state, &headers, &owner) {
            Ok(session) => Some(session),
            Err(e) => return error_response(status_for(&e), &e),
        }
    } else {
        None
    };

    let frame = match parse_request(&body) {
        Ok(frame) => frame,
        Err(e) => {
            if let Some(session) = &session {
                warn!(session = %session.id, error = %e, "malformed frame");
                state
                    .manager
                    .terminate(&session.id, TerminationReason::MalformedFrame);
            }
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };

    let session = match session {
        Some(session) => session,
        None if frame.method.parse::<Method>().ok() == Some(Method::Initialize) => state
            .manager
            .create_session(TrustContext::Remote, &owner),
        None => {
            let e = MemoryError::InvalidRequest(format!(
                "missing {SESSION_HEADER} header; send initialize first"
            ));
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };

    let session_header = [(SESSION_HEADER, session.id.clone())];
    match state.manager.handle(&session, frame).await {
        Some(response) => (StatusCode::OK, session_header, Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, session_header).into_response(),
    }
}

async fn delete_rpc(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let owner = match resolve_owner(&state, &headers).await {
        Ok(owner) => owner,
        Err(e) => return error_response(status_for(&e), &e),
    };
    match existing_session(&state, &headers, &owner) {
        Ok(session) => {
            state
                .manager
                .terminate(&session.id, TerminationReason::ClientRequest);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(status_for(&e), &e),
    }
}

/// Terminates the session when the SSE stream is dropped.
struct StreamGuard {
    manager: Arc<SessionManager>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.manager
            .terminate(&self.session_id, TerminationReason::StreamClosed);
    }
}

fn event_stream(
    events: mpsc::Receiver<EventFrame>,
    guard: StreamGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((events, guard), |(mut events, guard)| async move {
        let frame = events.recv().await?;
        let event = match serde_json::to_string(&frame) {
            Ok(data) => Event::default().event(frame.event.clone()).data(data),
            Err(e) => Event::default().comment(format!("unencodable event: {e}")),
        };
        Some((Ok(event), (events, guard)))
    })
}

async fn get_events(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let owner = match resolve_owner(&state, &headers).await {
        Ok(owner) => owner,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let session = match existing_session(&state, &headers, &owner) {
        Ok(session) => session,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let events = match state.manager.attach_events(&session) {
        Ok(events) => events,
        Err(e) => return error_response(StatusCode::CONFLICT, &e),
    };
    info!(session = %session.id, "event stream attached");

    let guard = StreamGuard {
        manager: state.manager.clone(),
        session_id: session.id.clone(),
    };
    Sse::new(event_stream(events, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn health(State(state): State<HttpState>) -> Response {
    Json(json!({
        "status": "ok",
        "sessions": state.manager.active_count(),
        "embedding_model": state.manager.coordinator().embedding_model(),
        "capabilities": state.manager.registry().len(),
    }))
    .into_response()
}
