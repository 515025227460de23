//! Session state machine and call dispatch, shared by both transports.
//!
//! ```text
//! Uninitialized --initialize--> Initialized --initialized / capabilities/*--> Active
//!        \                            \                                        |
//!         +----------------------------+---- terminate | idle | stream closed | malformed frame
//!                                                                              v
//!                                                                         Terminated
//! ```
//!
//! Local (stdio) calls run inline and are unbounded. Remote calls each run as their own task
//! under a child of the session's cancellation token and the configured call timeout, so
//! tearing down the session aborts whatever is still in flight.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::permissions::{classify, Decision, TrustContext};
use super::{parse_request, EventFrame, Method, RequestFrame, ResponseFrame, PROTOCOL_ID};
use crate::config::ServerConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::coordinator::MemoryCoordinator;
use crate::tools::{CallContext, CapabilityRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ClientRequest,
    IdleTimeout,
    StreamClosed,
    MalformedFrame,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Active,
    Terminated(TerminationReason),
}

impl SessionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

pub struct Session {
    pub id: String,
    pub trust: TrustContext,
    pub owner: String,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    events: Mutex<Option<mpsc::Sender<EventFrame>>>,
    capabilities: Mutex<Vec<String>>,
}

impl Session {
    fn new(trust: TrustContext, owner: String) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            trust,
            owner,
            state: Mutex::new(SessionState::Uninitialized),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            events: Mutex::new(None),
            capabilities: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Terminated(TerminationReason::Shutdown))
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// Cancelled when the session terminates.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Capability names advertised at `initialize`.
    pub fn negotiated_capabilities(&self) -> Vec<String> {
        self.capabilities
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut s) = self.state.lock() {
            if !s.is_terminated() {
                *s = next;
            }
        }
    }

    /// `Initialized -> Active`. Other states are left alone.
    fn activate(&self) {
        if let Ok(mut s) = self.state.lock() {
            if *s == SessionState::Initialized {
                *s = SessionState::Active;
            }
        }
    }

    /// Returns `false` if the session was already terminated.
    fn mark_terminated(&self, reason: TerminationReason) -> bool {
        let Ok(mut s) = self.state.lock() else {
            return false;
        };
        if s.is_terminated() {
            return false;
        }
        *s = SessionState::Terminated(reason);
        true
    }

    /// Queue an event without waiting. Full or detached channels drop it.
    pub fn emit(&self, event: EventFrame) {
        let Ok(events) = self.events.lock() else {
            return;
        };
        if let Some(tx) = events.as_ref() {
            if let Err(e) = tx.try_send(event) {
                debug!(session = %self.id, error = %e, "event dropped");
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    protocol_version: Option<String>,
    client_info: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    registry: Arc<CapabilityRegistry>,
    coordinator: Arc<MemoryCoordinator>,
    call_timeout: Duration,
    idle_timeout: Duration,
    event_buffer: usize,
}

impl SessionManager {
    pub fn new(
        coordinator: Arc<MemoryCoordinator>,
        registry: Arc<CapabilityRegistry>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            coordinator,
            call_timeout: config.call_timeout(),
            idle_timeout: config.idle_timeout(),
            event_buffer: config.event_buffer.max(1),
        }
    }

    pub fn coordinator(&self) -> &Arc<MemoryCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn create_session(&self, trust: TrustContext, owner: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(trust, owner.to_string()));
        self.sessions.insert(session.id.clone(), session.clone());
        info!(
            session = %session.id,
            trust = trust.as_str(),
            owner = %owner,
            "session created"
        );
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Live (non-terminated) sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| !s.value().is_terminated())
            .count()
    }

    /// Terminate a session, cancelling its in-flight calls and closing its event stream.
    /// Returns `false` if it was unknown or already terminated.
    pub fn terminate(&self, id: &str, reason: TerminationReason) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.mark_terminated(reason) {
            return false;
        }
        session.cancel.cancel();
        if let Ok(mut events) = session.events.lock() {
            events.take();
        }
        info!(session = %id, reason = ?reason, "session terminated");
        true
    }

    /// Terminate every live session.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.terminate(&id, TerminationReason::Shutdown);
        }
    }

    /// Open the session's event channel and start forwarding the owner's
    /// `memory/changed` events into it. A session has at most one event stream.
    pub fn attach_events(&self, session: &Arc<Session>) -> MemoryResult<mpsc::Receiver<EventFrame>> {
        if session.is_terminated() {
            return Err(MemoryError::SessionTerminated);
        }
        let (tx, rx) = mpsc::channel(self.event_buffer);
        {
            let mut events = session
                .events
                .lock()
                .map_err(|e| MemoryError::Internal(anyhow::anyhow!("session lock poisoned: {e}")))?;
            if events.is_some() {
                return Err(MemoryError::InvalidRequest(
                    "an event stream is already attached to this session".into(),
                ));
            }
            *events = Some(tx);
        }

        session.emit(EventFrame::new(
            "session/ready",
            json!({ "session_id": session.id, "trust": session.trust, "owner": session.owner }),
        ));

        let mut changes = self.coordinator.subscribe();
        let session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(event) if event.owner_id == session.owner => {
                            match serde_json::to_value(&event) {
                                Ok(data) => session.emit(EventFrame::new("memory/changed", data)),
                                Err(e) => warn!(error = %e, "failed to encode memory event"),
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(session = %session.id, skipped, "event forwarder lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(session = %session.id, "event forwarder stopped");
        });
        Ok(rx)
    }

    /// Parse and dispatch one raw frame. A frame that cannot be parsed terminates the session.
    pub async fn handle_text(&self, session: &Arc<Session>, text: &str) -> Option<ResponseFrame> {
        match parse_request(text) {
            Ok(frame) => self.handle(session, frame).await,
            Err(e) => {
                warn!(session = %session.id, error = %e, "malformed frame");
                self.terminate(&session.id, TerminationReason::MalformedFrame);
                Some(ResponseFrame::failure(None, &e))
            }
        }
    }

    /// Dispatch one request. Notifications (no `id`) never produce a response.
    pub async fn handle(&self, session: &Arc<Session>, frame: RequestFrame) -> Option<ResponseFrame> {
        session.touch();
        let id = frame.id.clone();
        let is_notification = id.is_none();
        let result = self.dispatch(session, frame).await;
        if is_notification {
            if let Err(e) = &result {
                debug!(session = %session.id, error = %e, "notification failed");
            }
            return None;
        }
        Some(match result {
            Ok(value) => ResponseFrame::success(id, value),
            Err(e) => ResponseFrame::failure(id, &e),
        })
    }

    async fn dispatch(&self, session: &Arc<Session>, frame: RequestFrame) -> MemoryResult<Value> {
        let state = session.state();
        if state.is_terminated() {
            return Err(MemoryError::SessionTerminated);
        }
        let method: Method = frame.method.parse()?;

        match method {
            Method::Ping => Ok(json!({})),
            Method::Initialize => self.initialize(session, state, frame.params),
            _ if state == SessionState::Uninitialized => Err(MemoryError::NotInitialized),
            Method::Initialized => {
                session.activate();
                Ok(json!({}))
            }
            Method::ListCapabilities => {
                session.activate();
                Ok(json!({ "capabilities": self.registry.advertise(session.trust) }))
            }
            Method::CallCapability => {
                session.activate();
                let params: CallParams = serde_json::from_value(frame.params).map_err(|e| {
                    MemoryError::InvalidRequest(format!("invalid capabilities/call params: {e}"))
                })?;
                self.call(session, params).await
            }
            Method::Terminate => {
                self.terminate(&session.id, TerminationReason::ClientRequest);
                Ok(json!({ "terminated": true }))
            }
        }
    }

    fn initialize(
        &self,
        session: &Arc<Session>,
        state: SessionState,
        params: Value,
    ) -> MemoryResult<Value> {
        if state != SessionState::Uninitialized {
            return Err(MemoryError::InvalidRequest("session is already initialized".into()));
        }
        let params: InitializeParams = if params.is_null() {
            InitializeParams::default()
        } else {
            serde_json::from_value(params)
                .map_err(|e| MemoryError::InvalidRequest(format!("invalid initialize params: {e}")))?
        };
        if let Some(version) = params.protocol_version.as_deref() {
            if version != PROTOCOL_ID {
                return Err(MemoryError::InvalidRequest(format!(
                    "unsupported protocol version '{version}', expected '{PROTOCOL_ID}'"
                )));
            }
        }

        let advertised = self.registry.advertise(session.trust);
        if let Ok(mut caps) = session.capabilities.lock() {
            *caps = advertised.iter().map(|c| c.name.clone()).collect();
        }
        session.set_state(SessionState::Initialized);
        let client = params.client_info.clone().unwrap_or(Value::Null);
        info!(
            session = %session.id,
            client = %client,
            capabilities = advertised.len(),
            "session initialized"
        );

        Ok(json!({
            "protocolVersion": PROTOCOL_ID,
            "sessionId": session.id,
            "serverInfo": { "name": "memhub", "version": env!("CARGO_PKG_VERSION") },
            "trust": session.trust,
            "owner": session.owner,
            "capabilities": advertised.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        }))
    }

    async fn call(&self, session: &Arc<Session>, params: CallParams) -> MemoryResult<Value> {
        let name = params.name;
        let decision = classify(&name, session.trust);
        if decision == Decision::Deny {
            warn!(
                session = %session.id,
                owner = %session.owner,
                capability = %name,
                decision = ?decision,
                "capability call denied"
            );
            return Err(MemoryError::PermissionDenied(name));
        }
        let capability = self
            .registry
            .get(&name)
            .ok_or_else(|| MemoryError::NotFound(format!("capability '{name}'")))?;

        let call_id = uuid::Uuid::now_v7().to_string();
        session.emit(EventFrame::new(
            "call/started",
            json!({ "call_id": call_id, "name": name }),
        ));

        let cancel = session.cancel.child_token();
        let ctx = CallContext {
            owner: session.owner.clone(),
            session_id: session.id.clone(),
            trust: session.trust,
            coordinator: self.coordinator.clone(),
            cancel: cancel.clone(),
        };
        let started = Instant::now();

        let result = match session.trust {
            TrustContext::Local => capability.invoke(&ctx, params.arguments).await,
            TrustContext::Remote => {
                let arguments = params.arguments;
                let task = tokio::spawn(async move { capability.invoke(&ctx, arguments).await });
                let abort = task.abort_handle();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        abort.abort();
                        Err(MemoryError::Cancelled("session closed".into()))
                    }
                    joined = tokio::time::timeout(self.call_timeout, task) => match joined {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(MemoryError::Internal(anyhow::anyhow!(
                            "capability task failed: {e}"
                        ))),
                        Err(_) => {
                            cancel.cancel();
                            abort.abort();
                            Err(MemoryError::Timeout(self.call_timeout.as_secs()))
                        }
                    },
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(
                session = %session.id,
                owner = %session.owner,
                capability = %name,
                decision = ?decision,
                elapsed_ms,
                "capability call completed"
            ),
            Err(e) => warn!(
                session = %session.id,
                owner = %session.owner,
                capability = %name,
                decision = ?decision,
                elapsed_ms,
                kind = ?e.kind(),
                error = %e,
                "capability call failed"
            ),
        }
        session.emit(EventFrame::new(
            "call/completed",
            json!({
                "call_id": call_id,
                "name": name,
                "ok": result.is_ok(),
                "elapsed_ms": elapsed_ms,
            }),
        ));
        result
    }

    /// Terminate remote sessions idle for at least `idle`. Sessions that were already
    /// terminated and have stayed quiet as long are forgotten. Local sessions are never
    /// reaped. Returns the number of sessions terminated.
    pub fn reap_idle_with(&self, idle: Duration) -> usize {
        let mut expired = Vec::new();
        let mut forget = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.idle_for() < idle {
                continue;
            }
            if session.is_terminated() {
                forget.push(session.id.clone());
            } else if session.trust == TrustContext::Remote {
                expired.push(session.id.clone());
            }
        }
        for id in &forget {
            self.sessions.remove(id);
        }
        let reaped = expired
            .iter()
            .filter(|id| self.terminate(id, TerminationReason::IdleTimeout))
            .count();
        if reaped > 0 {
            info!(reaped, forgotten = forget.len(), "idle sessions reaped");
        }
        reaped
    }

    pub fn reap_idle(&self) -> usize {
        self.reap_idle_with(self.idle_timeout)
    }

    /// Run [`reap_idle`](Self::reap_idle) every `every` until `stop` is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_idle();
                    }
                }
            }
        })
    }
}
