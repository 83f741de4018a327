//! Wire frames exchanged over the stream.
//!
//! Two inbound shapes share one socket:
//!
//! - **Event frames** pushed by the server:
//!   `{ "meta_object": {"type": ...}, "path": "/device/..", "event": "update", "data": {..}, "meta": {..} }`
//! - **JSON-RPC 2.0 responses** to requests issued over the stream:
//!   `{ "jsonrpc": "2.0", "id": "...", "result": .. }` or `.. "error": {..} }`
//!
//! A single text frame may also carry a JSON array of frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// JSON-RPC protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Event frames ─────────────────────────────────────────────────────

/// `meta` / `meta_object` block on a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Object type, e.g. `"device"`, `"value"`, `"notification"`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// What happened to the addressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Direct,
    /// Anything newer than this client understands.
    #[serde(other)]
    Unknown,
}

/// A server-pushed event, as sent on the wire.
///
/// Uses `#[serde(flatten)]` to keep fields beyond the core set, so nothing
/// the server adds is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub path: String,

    #[serde(default)]
    pub event: Option<EventKind>,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub meta: Option<FrameMeta>,

    #[serde(default)]
    pub meta_object: Option<FrameMeta>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── JSON-RPC ─────────────────────────────────────────────────────────

/// Outbound request sent over the stream.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Deserialization {
            message: format!("failed to encode request: {e}"),
            body: String::new(),
        })
    }
}

/// Error object inside a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response to a request issued over the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Correlation key: string ids as is, anything else in JSON form.
    pub fn correlation_id(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Event(EventFrame),
    Response(RpcResponse),
}

/// Decode a text frame into its constituent frames.
///
/// Each element is decoded independently: one bad element in a batch
/// yields one `Err` without hiding its neighbours.
pub fn decode(text: &str) -> Vec<Result<Frame, Error>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.into_iter().map(decode_value).collect(),
        Ok(other) => vec![decode_value(other)],
        Err(e) => vec![Err(Error::MalformedFrame(e.to_string()))],
    }
}

fn decode_value(value: Value) -> Result<Frame, Error> {
    if is_response(&value) {
        return serde_json::from_value(value)
            .map(Frame::Response)
            .map_err(|e| Error::MalformedFrame(format!("bad response frame: {e}")));
    }
    if value.get("path").is_some() {
        return serde_json::from_value(value)
            .map(Frame::Event)
            .map_err(|e| Error::MalformedFrame(format!("bad event frame: {e}")));
    }
    Err(Error::MalformedFrame(
        "frame has neither a path nor a response id".into(),
    ))
}

/// The internal response marker: a JSON-RPC envelope carrying an id and
/// either a result or an error.
fn is_response(value: &Value) -> bool {
    value.get("jsonrpc").is_some()
        && value.get("id").is_some()
        && (value.get("result").is_some() || value.get("error").is_some())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_update_event() {
        let raw = json!({
            "meta_object": { "type": "event" },
            "event": "update",
            "path": "/device/123",
            "data": { "name": "new" },
            "extsync": false
        });

        let frames = decode(&raw.to_string());
        assert_eq!(frames.len(), 1);
        let Ok(Frame::Event(frame)) = &frames[0] else {
            panic!("expected event frame, got {frames:?}");
        };
        assert_eq!(frame.path, "/device/123");
        assert_eq!(frame.event, Some(EventKind::Update));
        assert_eq!(frame.data["name"], "new");
        assert_eq!(frame.extra["extsync"], false);
    }

    #[test]
    fn unknown_event_kind_is_not_an_error() {
        let raw = json!({ "path": "/device/1", "event": "teleport" });
        let frames = decode(&raw.to_string());
        let Ok(Frame::Event(frame)) = &frames[0] else {
            panic!("expected event frame");
        };
        assert_eq!(frame.event, Some(EventKind::Unknown));
    }

    #[test]
    fn decode_response_frame() {
        let raw = json!({ "jsonrpc": "2.0", "id": "abc", "result": { "ok": true } });
        let frames = decode(&raw.to_string());
        let Ok(Frame::Response(resp)) = &frames[0] else {
            panic!("expected response frame");
        };
        assert_eq!(resp.correlation_id(), "abc");
        assert_eq!(resp.result, Some(json!({ "ok": true })));
    }

    #[test]
    fn numeric_response_id_is_stringified() {
        let raw = json!({ "jsonrpc": "2.0", "id": 7, "error": { "code": -1, "message": "nope" } });
        let frames = decode(&raw.to_string());
        let Ok(Frame::Response(resp)) = &frames[0] else {
            panic!("expected response frame");
        };
        assert_eq!(resp.correlation_id(), "7");
        assert_eq!(resp.error.as_ref().unwrap().message, "nope");
    }

    #[test]
    fn batch_keeps_good_elements() {
        let raw = json!([
            { "path": "/value/1", "event": "delete" },
            { "nonsense": true },
            { "jsonrpc": "2.0", "id": "x", "result": null }
        ]);
        let frames = decode(&raw.to_string());
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Ok(Frame::Event(_))));
        assert!(matches!(frames[1], Err(Error::MalformedFrame(_))));
        // `result: null` still carries the key, so it is a response
        assert!(matches!(frames[2], Ok(Frame::Response(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        let frames = decode("not json at all");
        assert!(matches!(frames[0], Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn request_serializes_with_version_tag() {
        let req = RpcRequest::new("id-1", "POST", json!({ "url": "/2.0/device" }));
        let value: Value = serde_json::from_str(&req.to_frame().unwrap()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "id-1");
        assert_eq!(value["method"], "POST");
    }
}
