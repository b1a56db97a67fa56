//! JSON-RPC 2.0 message types
//!
//! The wire envelope shared by the Gateway and the Tool Server. Requests are
//! `{jsonrpc: "2.0", id, method, params}`; responses carry either `result`
//! or `error: {code, message, data?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// JSON-RPC protocol version accepted on the wire
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Result (on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Map a gateway [`Error`] to its wire form.
    ///
    /// The error `data` carries the stable kind and, for rate limiting, the
    /// `retry_after` seconds. Internal detail never crosses this boundary.
    #[must_use]
    pub fn from_error(id: Option<RequestId>, err: &Error) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("kind".to_string(), Value::from(err.kind()));
        if let Error::RateLimit { retry_after } = err {
            data.insert(
                "retry_after".to_string(),
                Value::from(retry_after.as_secs_f64().ceil() as u64),
            );
        }
        if let Error::Authorization { reason } = err {
            data.insert("reason".to_string(), Value::from(*reason));
        }
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: err.rpc_code(),
                message: err.public_message(),
                data: Some(Value::Object(data)),
            }),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Optional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID (string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID
    Number(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

/// `tools/call` request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCallParams {
    /// Tool name
    pub name: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Value,
}

/// `tools/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// Tools visible to the caller
    pub tools: Vec<ToolSummary>,
}

/// One entry of a `tools/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    /// Tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Declared argument schema (JSON Schema object)
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    #[test]
    fn request_deserializes_with_and_without_params() {
        let req: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .unwrap();
        assert_eq!(req.method, "tools/list");
        assert!(req.params.is_none());

        let req: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": "a", "method": "tools/call",
            "params": {"name": "search_web", "arguments": {"query": "q"}}
        }))
        .unwrap();
        assert_eq!(req.id, RequestId::String("a".to_string()));
        assert!(req.params.is_some());
    }

    #[test]
    fn success_response_omits_error() {
        let resp = JsonRpcResponse::success(RequestId::Number(7), json!({"ok": true}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["result"]["ok"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_response_carries_kind_in_data() {
        let resp = JsonRpcResponse::from_error(Some(RequestId::Number(1)), &Error::Authentication);
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32040);
        assert_eq!(err.message, "invalid credentials");
        assert_eq!(err.data.unwrap()["kind"], "AuthenticationError");
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let resp = JsonRpcResponse::from_error(
            Some(RequestId::Number(1)),
            &Error::RateLimit {
                retry_after: std::time::Duration::from_millis(2500),
            },
        );
        let data = resp.error.unwrap().data.unwrap();
        assert_eq!(data["retry_after"], 3);
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::Number(42).to_string(), "42");
        assert_eq!(RequestId::String("abc".to_string()).to_string(), "abc");
    }
}
