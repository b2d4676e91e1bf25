//! JSON-RPC 2.0 envelope helpers.
//!
//! The bridge never interprets method semantics; it only needs to
//! classify envelopes and synthesize well-formed error responses.

use serde_json::{Value, json};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const TIMEOUT: i32 = -32000;
pub const BLOCKED_BY_POLICY: i32 = -32001;
pub const UPSTREAM_UNAVAILABLE: i32 = -32002;
pub const UPSTREAM_RESTARTED: i32 = -32003;

/// Request: carries both `method` and `id`.
pub fn is_request(message: &Value) -> bool {
    message.get("method").is_some() && !message.get("id").unwrap_or(&Value::Null).is_null()
}

/// Notification: carries `method` but no `id`.
pub fn is_notification(message: &Value) -> bool {
    message.get("method").is_some() && message.get("id").unwrap_or(&Value::Null).is_null()
}

/// Response: carries `id` and a `result` or `error`, no `method`.
pub fn is_response(message: &Value) -> bool {
    message.get("method").is_none()
        && message.get("id").is_some()
        && (message.get("result").is_some() || message.get("error").is_some())
}

pub fn method(message: &Value) -> Option<&str> {
    message.get("method").and_then(|m| m.as_str())
}

/// Envelope check applied to every client-submitted message.
///
/// Batched arrays are rejected outright; objects must declare
/// `jsonrpc: "2.0"` and carry either a `method` or a response shape.
pub fn validate_envelope(message: &Value) -> std::result::Result<(), &'static str> {
    if message.is_array() {
        return Err("batch requests are not supported");
    }
    let Some(obj) = message.as_object() else {
        return Err("message must be a JSON object");
    };
    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Err("missing or invalid jsonrpc version");
    }
    if obj.get("method").is_none() && !is_response(message) {
        return Err("message is neither request, notification, nor response");
    }
    Ok(())
}

/// A bare JSON-RPC error object.
pub fn error_object(code: i32, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    error
}

/// A complete error response addressed to `id`.
pub fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error_object(code, message, data),
    })
}

/// A complete result response addressed to `id`.
pub fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}
