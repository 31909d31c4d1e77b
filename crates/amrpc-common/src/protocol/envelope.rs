//! AMRPC Request Envelope
//!
//! The body every client publishes: positional arguments plus keyword
//! arguments, serialized through a [`Codec`] as
//! `{"args": [...], "kwargs": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{AmrpcError, Result};
use crate::transport::Codec;

pub type RpcArgs = Vec<Value>;
pub type RpcKwargs = Map<String, Value>;

/// A request envelope: ordered positional arguments and named arguments.
///
/// Missing `args` or `kwargs` fields decode as empty, so a bare `{}` body
/// is a valid call with no arguments.
///
/// # Example
///
/// ```
/// use amrpc_common::Envelope;
/// use serde_json::json;
///
/// let envelope = Envelope::new()
///     .arg(10)
///     .arg(4)
///     .kwarg("round", true);
///
/// assert_eq!(envelope.args, vec![json!(10), json!(4)]);
/// assert_eq!(envelope.kwargs.get("round"), Some(&json!(true)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub args: RpcArgs,
    #[serde(default)]
    pub kwargs: RpcKwargs,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an envelope from positional arguments only.
    pub fn with_args(args: RpcArgs) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument, replacing any previous value for `name`.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Builds an envelope from JSON values as typed on a command line.
    ///
    /// `args` must be an array (or null) and `kwargs` an object (or null).
    pub fn from_json(args: Value, kwargs: Value) -> Result<Self> {
        let args = match args {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(AmrpcError::InvalidRequest(format!(
                    "args must be a JSON array, got {}",
                    other
                )))
            }
        };
        let kwargs = match kwargs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(AmrpcError::InvalidRequest(format!(
                    "kwargs must be a JSON object, got {}",
                    other
                )))
            }
        };
        Ok(Self { args, kwargs })
    }

    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        codec.encode(&serde_json::to_value(self)?)
    }

    pub fn decode(codec: &dyn Codec, data: &[u8]) -> Result<Self> {
        let value = codec.decode(data)?;
        serde_json::from_value(value).map_err(|e| {
            AmrpcError::InvalidRequest(format!("malformed request envelope: {}", e))
        })
    }
}
