//! JSON-RPC 2.0 framing.
//!
//! Moonraker speaks JSON-RPC 2.0 over the WebSocket: requests carry an
//! `id`, notifications do not. Inbound frames are classified here;
//! dispatch lives in the client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use helix_core::error::TransportError;

/// Outbound request or notification
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    pub fn call(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

/// Error envelope in a failed reply
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl From<RpcErrorBody> for TransportError {
    fn from(body: RpcErrorBody) -> Self {
        TransportError::Rpc {
            code: body.code,
            message: body.message,
        }
    }
}

/// A classified inbound frame
#[derive(Debug)]
pub enum InboundFrame {
    /// Successful reply to a request
    Result { id: u64, result: Value },
    /// Error reply to a request
    Error { id: u64, error: RpcErrorBody },
    /// Server-initiated notification
    Notification { method: String, params: Value },
}

/// Classify one inbound text frame
///
/// Frames with an `id` are replies; frames with a `method` are
/// notifications. Anything else is a framing error which the caller logs
/// and drops without touching the connection.
pub fn parse_frame(text: &str) -> Result<InboundFrame, TransportError> {
    let value: Value = serde_json::from_str(text).map_err(|e| TransportError::Parse {
        reason: e.to_string(),
    })?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(error) = value.get("error") {
            let error: RpcErrorBody =
                serde_json::from_value(error.clone()).map_err(|e| TransportError::Parse {
                    reason: format!("bad error envelope: {e}"),
                })?;
            return Ok(InboundFrame::Error { id, error });
        }
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        return Ok(InboundFrame::Result { id, result });
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return Ok(InboundFrame::Notification {
            method: method.to_string(),
            params,
        });
    }

    Err(TransportError::Parse {
        reason: "frame has neither id nor method".to_string(),
    })
}

/// Pull the status object out of a status-update notification
///
/// Moonraker delivers `[status_object, eventtime]`; returns the object
/// when the params have that shape.
pub fn status_update_payload(params: &Value) -> Option<&Value> {
    params.as_array().and_then(|a| a.first()).filter(|v| v.is_object())
}
