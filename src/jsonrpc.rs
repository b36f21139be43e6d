//! Wire types for the JSON-RPC 2.0 envelope the relay speaks on both sides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl JsonRpcRequest {
    /// Build a request for relay-internal use (health probes, outbound retries)
    /// where the `id` never reaches a client and is irrelevant.
    pub fn new_internal(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Value::Number(0.into()),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Canonicalize a `params` value for cache-key fingerprinting: compact
/// separators and lexicographically-sorted object keys. `serde_json::Value`
/// represents objects as a `BTreeMap` (the `preserve_order` feature is not
/// enabled), so `to_string` already yields sorted keys for free.
pub fn canonicalize_params(params: &Value) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_object_keys() {
        let a = json!({"to": "0xabc", "from": "0xdef", "value": "0x1"});
        let b = json!({"value": "0x1", "from": "0xdef", "to": "0xabc"});
        assert_eq!(canonicalize_params(&a), canonicalize_params(&b));
    }

    #[test]
    fn canonicalize_has_no_insignificant_whitespace() {
        let v = json!({"a": 1, "b": [1, 2, 3]});
        let s = canonicalize_params(&v);
        assert!(!s.contains(' '));
    }

    #[test]
    fn canonicalize_distinguishes_different_params() {
        let a = json!(["0x1", "latest"]);
        let b = json!(["0x1", "pending"]);
        assert_ne!(canonicalize_params(&a), canonicalize_params(&b));
    }
}
