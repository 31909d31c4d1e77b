//! Endpoint handlers.
//!
//! A handler receives the decoded request as a [`Call`] and returns any
//! serializable value. Failures are values too: whatever a handler returns
//! as its error becomes an error-shaped reply instead of propagating into
//! the receive loop.

use amrpc_common::protocol::{error_reply, Envelope, RpcArgs, RpcKwargs, ENCODE_FAILURE_MESSAGE};
use amrpc_common::AmrpcError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// A decoded request as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// The routing key the message arrived with
    pub routing_key: String,
    pub args: RpcArgs,
    pub kwargs: RpcKwargs,
}

impl Call {
    pub fn new(routing_key: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            routing_key: routing_key.into(),
            args: envelope.args,
            kwargs: envelope.kwargs,
        }
    }

    /// Deserializes the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::Failed(format!("missing positional argument {}", index))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            HandlerError::Failed(format!("invalid positional argument {}: {}", index, e))
        })
    }

    /// Deserializes the required keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        self.kwarg_opt(name)?
            .ok_or_else(|| HandlerError::Failed(format!("missing keyword argument '{}'", name)))
    }

    /// Deserializes the keyword argument `name` if present.
    pub fn kwarg_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                HandlerError::Failed(format!("invalid keyword argument '{}': {}", name, e))
            }),
        }
    }
}

/// Why a call produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure
    #[error("{0}")]
    Failed(String),

    /// The handler's result could not be serialized
    #[error("failed to encode result: {0}")]
    Unencodable(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// The error-shaped reply sent back to the caller.
    ///
    /// Encoding failures collapse into the generic payload; the detail
    /// only goes to the server log.
    pub fn to_reply(&self) -> Value {
        match self {
            HandlerError::Unencodable(_) => error_reply(ENCODE_FAILURE_MESSAGE),
            other => error_reply(other.to_string()),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl From<AmrpcError> for HandlerError {
    fn from(err: AmrpcError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// An endpoint implementation.
///
/// Any `Fn(Call) -> impl Future<Output = Result<T, E>>` where `T: Serialize`
/// and `E: Into<HandlerError>` is a handler:
///
/// ```
/// use amrpc_server::{Call, HandlerError};
///
/// let divide = |call: Call| async move {
///     let a: f64 = call.arg(0)?;
///     let b: f64 = call.arg(1)?;
///     if b == 0.0 {
///         return Err(HandlerError::failed("division by zero"));
///     }
///     Ok(a / b)
/// };
/// # let _ = divide;
/// ```
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, call: Call) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut, T, E> Handler for F
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    fn invoke(&self, call: Call) -> BoxFuture<'static, HandlerResult> {
        let future = (self)(call);
        Box::pin(async move {
            let value = future.await.map_err(Into::into)?;
            serde_json::to_value(value).map_err(|e| HandlerError::Unencodable(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;

    fn call(args: Value, kwargs: Value) -> Call {
        Call::new("am.test", Envelope::from_json(args, kwargs).unwrap())
    }

    #[test]
    fn test_typed_accessors() {
        let call = call(json!([1, "two"]), json!({"flag": true}));
        assert_eq!(call.arg::<i64>(0).unwrap(), 1);
        assert_eq!(call.arg::<String>(1).unwrap(), "two");
        assert!(call.kwarg::<bool>("flag").unwrap());
        assert_eq!(call.kwarg_opt::<bool>("other").unwrap(), None);
    }

    #[test]
    fn test_accessor_errors() {
        let call = call(json!(["x"]), json!({}));
        assert!(matches!(call.arg::<i64>(0), Err(HandlerError::Failed(_))));
        assert!(matches!(call.arg::<i64>(3), Err(HandlerError::Failed(_))));
        assert!(matches!(call.kwarg::<i64>("n"), Err(HandlerError::Failed(_))));
    }

    #[test]
    fn test_error_replies() {
        assert_eq!(HandlerError::failed("boom").to_reply(), json!({"error": "boom"}));
        assert_eq!(
            HandlerError::Unencodable("key must be a string".into()).to_reply(),
            json!({"error": "failed to encode result"})
        );
        assert_eq!(
            HandlerError::Panicked("oops".into()).to_reply(),
            json!({"error": "handler panicked: oops"})
        );
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |call: Call| async move {
            let n: i64 = call.arg(0)?;
            Ok::<_, HandlerError>(n * 2)
        };
        let result = handler.invoke(call(json!([21]), json!({}))).await;
        assert_eq!(result, Ok(json!(42)));
    }

    #[tokio::test]
    async fn test_closure_handler_with_string_error() {
        let handler = |_call: Call| async move { Err::<(), _>("nope") };
        let result = handler.invoke(call(json!([]), json!({}))).await;
        assert_eq!(result, Err(HandlerError::Failed("nope".into())));
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not representable"))
        }
    }

    #[tokio::test]
    async fn test_unencodable_result() {
        let handler = |_call: Call| async move { Ok::<_, HandlerError>(Unserializable) };
        let result = handler.invoke(call(json!([]), json!({}))).await;
        assert!(matches!(result, Err(HandlerError::Unencodable(_))));
    }
}
