//! AMRPC Reply Payloads
//!
//! A reply body is the handler's return value, as is. Failures are turned
//! into data: an object with a single `error` field.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// RPC method result (JSON value)
pub type RpcResult = Value;

/// Message sent back when the result itself could not be encoded.
pub const ENCODE_FAILURE_MESSAGE: &str = "failed to encode result";

/// The error-shaped reply: `{"error": "<message>"}`.
///
/// # Example
///
/// ```
/// use amrpc_common::protocol::reply::{error_reply, ErrorReply};
/// use serde_json::json;
///
/// let reply = error_reply("division by zero");
/// assert_eq!(reply, json!({"error": "division by zero"}));
///
/// let parsed = ErrorReply::from_value(&reply).unwrap();
/// assert_eq!(parsed.error, "division by zero");
///
/// // Ordinary results are not error-shaped
/// assert!(ErrorReply::from_value(&json!({"error": "x", "code": 1})).is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    /// Interprets a decoded reply as an error reply.
    ///
    /// Only an object whose sole field is a string `error` qualifies.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) if map.len() == 1 && map.contains_key("error") => {
                serde_json::from_value(value.clone()).ok()
            }
            _ => None,
        }
    }
}

/// Builds an error-shaped reply value.
pub fn error_reply(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}
