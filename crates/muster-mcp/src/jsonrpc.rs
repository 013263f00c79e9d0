//! JSON-RPC 2.0 types for MCP communication.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Standard JSON-RPC error code for an unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
///
/// The id is kept as a raw value: servers answering requests we never sent
/// may use string ids, and those must be discarded rather than rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    /// `Some(Value::Null)` for `"result": null`, `None` only when absent.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// The id as issued by this client, if it is one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Our answer to a request the server sent us.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A notification sent by the server.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// One frame read from a server, classified by shape.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// An answer to one of our requests.
    Response(JsonRpcResponse),
    /// A request the server expects us to answer.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A server notification.
    Notification(ServerNotification),
}

impl Incoming {
    /// Classify a decoded frame.
    ///
    /// Frames with a `method` are requests (with an id) or notifications
    /// (without); anything else must carry `result` or `error`.
    pub fn classify(frame: Value) -> Result<Self, String> {
        let Value::Object(mut map) = frame else {
            return Err("frame is not a JSON object".to_string());
        };

        if let Some(method) = map.remove("method") {
            let method = method
                .as_str()
                .ok_or_else(|| "'method' is not a string".to_string())?
                .to_string();
            let params = map.remove("params");
            return Ok(match map.remove("id") {
                Some(id) if !id.is_null() => Self::Request { id, method, params },
                _ => Self::Notification(ServerNotification { method, params }),
            });
        }

        if !map.contains_key("result") && !map.contains_key("error") {
            return Err("frame has neither method, result nor error".to_string());
        }
        serde_json::from_value(Value::Object(map))
            .map(Self::Response)
            .map_err(|e| format!("invalid response: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_with_params() {
        let req = JsonRpcRequest::new(
            1,
            "tools/call",
            Some(json!({"name": "read", "arguments": {}})),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/call");
        assert!(json["params"].is_object());
    }

    #[test]
    fn serialize_request_without_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 2);
        assert!(json.get("params").is_none());
    }

    #[test]
    fn serialize_notification() {
        let notif = JsonRpcNotification::new("notifications/initialized", Some(json!({})));
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "notifications/initialized");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn classify_response_with_result() {
        let frame = json!({"jsonrpc":"2.0","id":1,"result":{"tools":[]}});
        match Incoming::classify(frame).unwrap() {
            Incoming::Response(resp) => {
                assert_eq!(resp.numeric_id(), Some(1));
                assert!(resp.result.is_some());
                assert!(resp.error.is_none());
            }
            other => panic!("Expected response, got: {other:?}"),
        }
    }

    #[test]
    fn classify_null_result_is_a_success() {
        let frame = json!({"jsonrpc":"2.0","id":3,"result":null});
        match Incoming::classify(frame).unwrap() {
            Incoming::Response(resp) => {
                assert_eq!(resp.result, Some(Value::Null));
                assert!(resp.error.is_none());
            }
            other => panic!("Expected response, got: {other:?}"),
        }

        let frame = json!({"jsonrpc":"2.0","id":4,"error":{"code":-1,"message":"x"}});
        match Incoming::classify(frame).unwrap() {
            Incoming::Response(resp) => assert!(resp.result.is_none()),
            other => panic!("Expected response, got: {other:?}"),
        }
    }

    #[test]
    fn classify_response_with_error_data() {
        let frame = json!({"jsonrpc":"2.0","id":7,"error":{"code":-32600,"message":"Invalid","data":"extra"}});
        match Incoming::classify(frame).unwrap() {
            Incoming::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, -32600);
                assert_eq!(err.data.unwrap(), "extra");
            }
            other => panic!("Expected response, got: {other:?}"),
        }
    }

    #[test]
    fn classify_string_id_response_has_no_numeric_id() {
        let frame = json!({"jsonrpc":"2.0","id":"abc","result":{}});
        match Incoming::classify(frame).unwrap() {
            Incoming::Response(resp) => assert_eq!(resp.numeric_id(), None),
            other => panic!("Expected response, got: {other:?}"),
        }
    }

    #[test]
    fn classify_server_request_and_notification() {
        let ping = json!({"jsonrpc":"2.0","id":"srv-1","method":"ping"});
        assert!(matches!(
            Incoming::classify(ping).unwrap(),
            Incoming::Request { ref method, .. } if method == "ping"
        ));

        let changed = json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"});
        match Incoming::classify(changed).unwrap() {
            Incoming::Notification(n) => {
                assert_eq!(n.method, "notifications/tools/list_changed");
                assert!(n.params.is_none());
            }
            other => panic!("Expected notification, got: {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_shapeless_frames() {
        assert!(Incoming::classify(json!([1, 2, 3])).is_err());
        assert!(Incoming::classify(json!({"jsonrpc":"2.0","id":3})).is_err());
    }

    #[test]
    fn reply_serialization() {
        let ok = serde_json::to_value(JsonRpcReply::result(json!("srv-1"), json!({}))).unwrap();
        assert_eq!(ok["id"], "srv-1");
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(JsonRpcReply::error(json!(4), METHOD_NOT_FOUND, "nope"))
            .unwrap();
        assert_eq!(err["error"]["code"], -32601);
        assert!(err["error"].get("data").is_none());
        assert!(err.get("result").is_none());
    }
}
