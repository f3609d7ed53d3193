use serde::{Deserialize, Serialize};
use serde_json::Value;

fn version() -> String {
    "2.0".to_string()
}

/// JSON-RPC 2.0 Request object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: String, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Get a string member of the `params` object.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }

    /// Get a boolean member of the `params` object, absent meaning false.
    pub fn param_bool(&self, key: &str) -> bool {
        self.params
            .as_ref()
            .and_then(|params| params.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Get an arbitrary member of the `params` object.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref()?.get(key)
    }
}

/// JSON-RPC 2.0 Response object.
///
/// Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: String, result: Value) -> Self {
        Self {
            jsonrpc: version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: String, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: version(),
            result: None,
            error: Some(RpcError {
                message: message.into(),
                code,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Get a member of the `result` object.
    pub fn result_value(&self, key: &str) -> Option<&Value> {
        self.result.as_ref()?.get(key)
    }
}

/// JSON-RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_accessors() {
        let request = Request::new(
            "1".to_string(),
            "blade.subscribe",
            Some(serde_json::json!({
                "event": "e",
                "protocol": "p",
                "realm": "r",
                "remove": true,
            })),
        );

        assert_eq!(request.param_str("event"), Some("e"));
        assert_eq!(request.param_str("missing"), None);
        assert!(request.param_bool("remove"));
        assert!(!request.param_bool("missing"));
    }

    #[test]
    fn remove_defaults_to_false() {
        let request = Request::new("1".to_string(), "blade.register", Some(serde_json::json!({ "nodeid": "n" })));
        assert!(!request.param_bool("remove"));
    }

    #[test]
    fn error_response_shape() {
        let response = Response::error("7".to_string(), crate::INVALID_PARAMS, "Missing params nodeid");
        assert!(response.is_error());
        assert!(response.result.is_none());

        let frame = serde_json::to_string(&response).unwrap();
        assert!(!frame.contains("\"result\""));
        assert!(frame.contains("-32602"));
    }
}
