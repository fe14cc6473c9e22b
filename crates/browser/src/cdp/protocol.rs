//! CDP Protocol Types
//!
//! Outgoing commands are `{id, method, params}`. Incoming frames are either a
//! response (`id` plus `result` or `error`) or an event (`method` plus
//! `params`, no `id`). The receiver does not know which in advance, so
//! [`CdpMessage::decode`] reads a minimal envelope first and branches on it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::connection::CdpError;

/// Request ID - monotonically increasing per connection
pub type RequestId = u64;

/// Target ID from Chrome
pub type TargetId = String;

/// CDP Request sent to browser
#[derive(Debug, Clone, Serialize)]
pub struct CdpRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl CdpRequest {
    /// `params` must be a JSON object; `null` is sent as `{}`.
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// CDP Response from browser
#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

impl CdpResponse {
    /// Unwrap the result, surfacing an `error` object as [`CdpError::Remote`].
    pub fn into_result(self) -> Result<Value, CdpError> {
        if let Some(error) = self.error {
            return Err(CdpError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// CDP Event from browser (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// An inbound frame, already classified
#[derive(Debug, Clone)]
pub enum CdpMessage {
    Response(CdpResponse),
    Event(CdpEvent),
}

/// Just enough of a frame to tell responses from events.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

impl CdpMessage {
    pub fn decode(text: &str) -> Result<Self, CdpError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| CdpError::Decode(e.to_string()))?;

        match (envelope.id, envelope.method) {
            (Some(id), _) => Ok(CdpMessage::Response(CdpResponse {
                id,
                result: envelope.result,
                error: envelope.error,
            })),
            (None, Some(method)) => Ok(CdpMessage::Event(CdpEvent {
                method,
                params: envelope.params,
            })),
            (None, None) => Err(CdpError::Decode(
                "frame has neither an id nor a method".to_string(),
            )),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            CdpMessage::Event(event) => Some(&event.method),
            CdpMessage::Response(_) => None,
        }
    }
}

/// Result of Target.createTarget
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTargetResult {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
}
