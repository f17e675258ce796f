//! JSON-RPC 2.0 message model.
//!
//! LSP traffic through the gateway is mostly opaque: messages stay
//! `serde_json::Value` end to end and only the envelope (`jsonrpc`, `id`,
//! `method`, `result`/`error`) is inspected for routing.

use serde_json::{json, Value};

/// Correlation key for a request id. JSON-RPC allows integers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Number(i64),
    Text(String),
}

impl RequestKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// What a message is, judging by its envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` + `id`.
    Request,
    /// `id` + (`result` | `error`), no `method`.
    Response,
    /// `method`, no `id`.
    Notification,
    /// None of the above.
    Other,
}

pub fn classify(msg: &Value) -> MessageKind {
    let has_id = msg.get("id").is_some_and(|id| !id.is_null());
    let has_method = msg.get("method").is_some();
    match (has_method, has_id) {
        (true, true) => MessageKind::Request,
        (true, false) => MessageKind::Notification,
        (false, true) => MessageKind::Response,
        (false, false) => MessageKind::Other,
    }
}

pub fn method(msg: &Value) -> Option<&str> {
    msg.get("method").and_then(Value::as_str)
}

pub fn request_id(msg: &Value) -> Option<RequestKey> {
    msg.get("id").and_then(RequestKey::from_value)
}

/// The raw `id` for echoing into replies; `Null` when absent.
pub fn id_value(msg: &Value) -> Value {
    msg.get("id").cloned().unwrap_or(Value::Null)
}

pub fn is_jsonrpc_2(msg: &Value) -> bool {
    msg.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
}

pub fn request(id: i64, method: &str, params: Option<Value>) -> Value {
    let mut msg = json!({ "jsonrpc": "2.0", "id": id, "method": method });
    if let Some(params) = params {
        msg["params"] = params;
    }
    msg
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut msg = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(params) = params {
        msg["params"] = params;
    }
    msg
}

pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}
