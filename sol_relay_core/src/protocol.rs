// JSON-RPC framing shared by the client side and the upstream side of the relay

use crate::registry::SubscriptionId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INVALID_PARAMS: i64 = -32602;
pub const UPSTREAM_UNAVAILABLE: i64 = -32000;

const SUBSCRIBE_SUFFIX: &str = "Subscribe";
const UNSUBSCRIBE_SUFFIX: &str = "Unsubscribe";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Error frame sent back to a single client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub jsonrpc: String,
    pub error: RpcError,
    pub id: Value,
}

impl ErrorReply {
    pub fn new(code: i64, message: impl Into<String>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: RpcError {
                code,
                message: message.into(),
            },
            id,
        }
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail), Value::Null)
    }

    pub fn invalid_request(message: impl Into<String>, id: Value) -> Self {
        Self::new(INVALID_REQUEST, message, id)
    }

    pub fn invalid_params(message: impl Into<String>, id: Value) -> Self {
        Self::new(INVALID_PARAMS, message, id)
    }

    pub fn upstream_unavailable(id: Value) -> Self {
        Self::new(
            UPSTREAM_UNAVAILABLE,
            "Upstream connection unavailable, reconnecting; retry shortly",
            id,
        )
    }

    pub fn to_text(&self) -> String {
        // Serializing a struct of strings, numbers and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A request frame received from a local client.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
    raw: Map<String, Value>,
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, ErrorReply> {
        let value: Value = serde_json::from_str(text).map_err(ErrorReply::parse_error)?;
        let raw = match value {
            Value::Object(map) => map,
            _ => {
                return Err(ErrorReply::invalid_request(
                    "Invalid request: expected a JSON object",
                    Value::Null,
                ))
            }
        };
        let id = raw.get("id").cloned().unwrap_or(Value::Null);
        let method = match raw.get("method").and_then(Value::as_str) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => {
                return Err(ErrorReply::invalid_request(
                    "Invalid request: missing method",
                    id,
                ))
            }
        };
        let params = raw.get("params").cloned();
        Ok(Self {
            id,
            method,
            params,
            raw,
        })
    }

    /// `accountSubscribe`, `logsSubscribe`, ... (case-sensitive suffix match).
    pub fn is_subscribe(&self) -> bool {
        self.method.ends_with(SUBSCRIBE_SUFFIX)
    }

    pub fn is_unsubscribe(&self) -> bool {
        self.method.ends_with(UNSUBSCRIBE_SUFFIX)
    }

    /// Params of a subscribe request as an ordered list. Missing or null
    /// params are an empty list; anything other than an array is rejected.
    pub fn subscription_params(&self) -> Result<Vec<Value>, ErrorReply> {
        match &self.params {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(_) => Err(ErrorReply::invalid_params(
                "Invalid params: subscription params must be an array",
                self.id.clone(),
            )),
        }
    }

    /// First positional param as an upstream subscription number.
    pub fn first_param_u64(&self) -> Option<u64> {
        self.params
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(Value::as_u64)
    }

    /// The original frame with its `id` replaced by a relay-assigned id.
    pub fn with_id(&self, id: SubscriptionId) -> String {
        let mut raw = self.raw.clone();
        raw.insert("id".to_string(), Value::from(id));
        Value::Object(raw).to_string()
    }
}

pub fn subscribe_request(id: SubscriptionId, method: &str, params: &[Value]) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// `accountSubscribe` -> `accountUnsubscribe`.
pub fn unsubscribe_method(subscribe_method: &str) -> Option<String> {
    subscribe_method
        .strip_suffix(SUBSCRIBE_SUFFIX)
        .map(|prefix| format!("{}{}", prefix, UNSUBSCRIBE_SUFFIX))
}

pub fn unsubscribe_request(id: SubscriptionId, subscribe_method: &str, upstream_id: u64) -> Option<String> {
    unsubscribe_method(subscribe_method).map(|method| {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": [upstream_id],
        })
        .to_string()
    })
}

/// Shape of a frame received from the upstream provider.
#[derive(Debug, PartialEq)]
pub enum UpstreamMessage<'a> {
    /// Push message (`method` present, no id).
    Notification,
    /// Direct reply to a request.
    Reply {
        id: &'a Value,
        result: Option<&'a Value>,
        is_error: bool,
    },
    Unrecognized,
}

pub fn classify(value: &Value) -> UpstreamMessage<'_> {
    match value.get("id") {
        Some(id) if !id.is_null() => UpstreamMessage::Reply {
            id,
            result: value.get("result"),
            is_error: value.get("error").is_some(),
        },
        _ if value.get("method").is_some() => UpstreamMessage::Notification,
        _ => UpstreamMessage::Unrecognized,
    }
}
