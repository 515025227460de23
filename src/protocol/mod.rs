//! Wire envelope shared by both transports.
//!
//! ```text
//! request   {"protocol":"memhub/1","id":7,"method":"capabilities/call","params":{...}}
//! response  {"protocol":"memhub/1","id":7,"result":{...}}
//! error     {"protocol":"memhub/1","id":7,"error":{"kind":"permission_denied","message":"..."}}
//! event     {"protocol":"memhub/1","event":"memory/changed","data":{...}}
//! ```
//!
//! A request without an `id` is a notification and gets no response.

pub mod auth;
pub mod permissions;
pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, MemoryError};

pub const PROTOCOL_ID: &str = "memhub/1";

#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub protocol: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_string(),
            id: None,
            method: method.to_string(),
            params: Value::Null,
        }
    }
}

/// Parse one inbound frame. Anything that is not a well-formed `memhub/1` request is an
/// `invalid_request`.
pub fn parse_request(text: &str) -> Result<RequestFrame, MemoryError> {
    let frame: RequestFrame = serde_json::from_str(text)
        .map_err(|e| MemoryError::InvalidRequest(format!("malformed frame: {e}")))?;
    if frame.protocol != PROTOCOL_ID {
        return Err(MemoryError::InvalidRequest(format!(
            "unsupported protocol '{}', expected '{PROTOCOL_ID}'",
            frame.protocol
        )));
    }
    if frame.method.is_empty() {
        return Err(MemoryError::InvalidRequest("method must not be empty".into()));
    }
    Ok(frame)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    pub protocol: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            protocol: PROTOCOL_ID,
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, err: &MemoryError) -> Self {
        Self {
            protocol: PROTOCOL_ID,
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.public_message(),
                data: err.data(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    pub protocol: &'static str,
    pub event: String,
    pub data: Value,
}

impl EventFrame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            protocol: PROTOCOL_ID,
            event: event.to_string(),
            data,
        }
    }
}

/// Protocol methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    Ping,
    ListCapabilities,
    CallCapability,
    Terminate,
}

impl std::str::FromStr for Method {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Self::Initialize),
            "notifications/initialized" => Ok(Self::Initialized),
            "ping" => Ok(Self::Ping),
            "capabilities/list" => Ok(Self::ListCapabilities),
            "capabilities/call" => Ok(Self::CallCapability),
            "terminate" => Ok(Self::Terminate),
            other => Err(MemoryError::MethodNotFound(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_request() {
        let frame = parse_request(
            r#"{"protocol":"memhub/1","id":1,"method":"ping","params":{}}"#,
        )
        .unwrap();
        assert_eq!(frame.method, "ping");
        assert_eq!(frame.id, Some(json!(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let frame =
            parse_request(r#"{"protocol":"memhub/1","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(frame.id.is_none());
        assert_eq!(frame.params, Value::Null);
    }

    #[test]
    fn rejects_wrong_protocol_and_garbage() {
        assert!(parse_request(r#"{"protocol":"jsonrpc","method":"ping"}"#).is_err());
        assert!(parse_request("not json").is_err());
        assert!(parse_request(r#"{"protocol":"memhub/1","method":""}"#).is_err());
    }

    #[test]
    fn error_frames_carry_kind() {
        let frame = ResponseFrame::failure(
            Some(json!("a")),
            &MemoryError::PermissionDenied("memory_export".into()),
        );
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["error"]["kind"], "permission_denied");
        assert_eq!(v["id"], "a");
        assert!(v.get("result").is_none());
    }

    #[test]
    fn error_body_decodes_from_the_wire() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"kind":"session_terminated","message":"session has been terminated"}"#,
        )
        .unwrap();
        assert_eq!(body.kind, ErrorKind::SessionTerminated);
        assert!(body.data.is_none());
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let err = "tools/call".parse::<Method>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);
    }
}
