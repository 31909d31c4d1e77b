use serde_json::Value;

use crate::protocol::error::{AmrpcError, Result};

/// Codec for encoding/decoding message bodies
///
/// Request envelopes and replies are handled as JSON values; a codec only
/// decides how a value becomes bytes on the wire. JSON is the default and
/// the only format shipped, but clients and servers accept any
/// implementation through `with_codec`.
///
/// # Example
///
/// ```
/// use amrpc_common::transport::{Codec, JsonCodec};
/// use serde_json::json;
///
/// let codec = JsonCodec;
/// let encoded = codec.encode(&json!({"n": 42})).unwrap();
/// assert_eq!(codec.decode(&encoded).unwrap(), json!({"n": 42}));
/// ```
pub trait Codec: Send + Sync + 'static {
    /// Short format name, for logs
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Value>;
}

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| AmrpcError::Codec(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data).map_err(|e| AmrpcError::Codec(e.to_string()))
    }
}
