//! Typed errors crossing the coordinator and protocol boundaries.
//!
//! Storage and embedding code below the coordinator works in `anyhow::Result`. Anything that
//! can reach a client is converted into [`MemoryError`], whose [`ErrorKind`] is the
//! machine-readable part of every error frame.

use serde::{Deserialize, Serialize};

use crate::memory::coordinator::DeleteReport;

/// Machine-readable error kind carried by every protocol error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ValidationError,
    PermissionDenied,
    TransportError,
    PartialFailure,
    Unauthorized,
    Timeout,
    Cancelled,
    NotInitialized,
    SessionTerminated,
    InvalidRequest,
    MethodNotFound,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: capability '{0}' is not available in this session")]
    PermissionDenied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("delete partially failed: {}", .0.summary())]
    PartialFailure(DeleteReport),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("call exceeded its {0}s time limit")]
    Timeout(u64),

    #[error("call cancelled: {0}")]
    Cancelled(String),

    #[error("session is not initialized")]
    NotInitialized,

    #[error("session has been terminated")]
    SessionTerminated,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::PartialFailure(_) => ErrorKind::PartialFailure,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::SessionTerminated => ErrorKind::SessionTerminated,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::MethodNotFound(_) => ErrorKind::MethodNotFound,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable message safe to send to an untrusted client. Internal errors never
    /// leak the underlying storage-engine message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Structured payload attached to the error frame, if any.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            Self::PartialFailure(report) => serde_json::to_value(report).ok(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.into())
    }
}
