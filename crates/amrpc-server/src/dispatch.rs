//! Per-message handling.
//!
//! The dispatcher turns one delivery into a [`Completion`]: whether to
//! acknowledge it and what to publish back. It never touches the channel;
//! the task owning the channel applies completions, so concurrently
//! running handlers never share channel operations.

use amrpc_common::protocol::{error_reply, Envelope, ENCODE_FAILURE_MESSAGE};
use amrpc_common::transport::{Codec, Delivery, ExchangeKind};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::endpoint::EndpointRegistry;
use crate::handler::{Call, Handler, HandlerError, HandlerResult};

/// The channel operations owed for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completion {
    pub delivery_tag: u64,
    pub ack: bool,
    pub reply: Option<PendingReply>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingReply {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    codec: Arc<dyn Codec>,
    kind: ExchangeKind,
}

impl Dispatcher {
    pub fn new(registry: Arc<EndpointRegistry>, codec: Arc<dyn Codec>, kind: ExchangeKind) -> Self {
        Self {
            registry,
            codec,
            kind,
        }
    }

    /// Fanout deliveries were acknowledged when they were sent.
    fn needs_ack(&self) -> bool {
        self.kind == ExchangeKind::Topic
    }

    /// [`handle`](Self::handle), with a panic anywhere in dispatch turned
    /// into an acknowledged error reply so the delivery never stays unacked.
    pub async fn handle_guarded(&self, delivery: Delivery) -> Completion {
        let delivery_tag = delivery.delivery_tag;
        let reply_to = delivery.properties.reply_to.clone();
        let correlation_id = delivery.properties.correlation_id.clone();
        match AssertUnwindSafe(self.handle(delivery)).catch_unwind().await {
            Ok(completion) => completion,
            Err(panic) => {
                let err = HandlerError::Panicked(panic_message(panic));
                tracing::error!("Dispatch of message {} failed: {}", delivery_tag, err);
                Completion {
                    delivery_tag,
                    ack: self.needs_ack(),
                    reply: reply_to.map(|reply_to| PendingReply {
                        reply_to,
                        correlation_id,
                        body: self.encode_reply(&err.to_reply()),
                    }),
                }
            }
        }
    }

    /// Handles one delivery end to end, short of touching the channel.
    pub async fn handle(&self, delivery: Delivery) -> Completion {
        let Some(endpoint) = self.registry.resolve(&delivery.routing_key) else {
            tracing::warn!(
                "No endpoint matches routing key '{}', dropping message",
                delivery.routing_key
            );
            return Completion {
                delivery_tag: delivery.delivery_tag,
                ack: self.needs_ack(),
                reply: None,
            };
        };
        let handler = endpoint.handler();
        tracing::debug!(
            "Dispatching {} to endpoint '{}'",
            delivery.routing_key,
            endpoint.key()
        );

        let result = match Envelope::decode(self.codec.as_ref(), &delivery.body) {
            Ok(envelope) => invoke(handler, Call::new(delivery.routing_key.clone(), envelope)).await,
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("Handler for {} failed: {}", delivery.routing_key, err);
                err.to_reply()
            }
        };

        let reply = delivery.properties.reply_to.map(|reply_to| PendingReply {
            reply_to,
            correlation_id: delivery.properties.correlation_id,
            body: self.encode_reply(&value),
        });

        Completion {
            delivery_tag: delivery.delivery_tag,
            ack: self.needs_ack(),
            reply,
        }
    }

    fn encode_reply(&self, value: &Value) -> Vec<u8> {
        match self.codec.encode(value) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to encode reply: {}", e);
                self.codec
                    .encode(&error_reply(ENCODE_FAILURE_MESSAGE))
                    .unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, ENCODE_FAILURE_MESSAGE).into_bytes())
            }
        }
    }
}

/// Runs a handler, turning a panic into a [`HandlerError::Panicked`].
async fn invoke(handler: Arc<dyn Handler>, call: Call) -> HandlerResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(call))) {
        Ok(future) => future,
        Err(panic) => return Err(HandlerError::Panicked(panic_message(panic))),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrpc_common::protocol::error::{AmrpcError, Result};
    use amrpc_common::transport::{JsonCodec, MessageProperties};
    use serde_json::json;

    fn dispatcher(kind: ExchangeKind) -> Dispatcher {
        let mut registry = EndpointRegistry::new();
        registry
            .register(
                "ping",
                "am.ping",
                Arc::new(|_call: Call| async move { Ok::<_, HandlerError>("pong") }),
            )
            .unwrap();
        registry
            .register(
                "ping_shadow",
                "am.*",
                Arc::new(|_call: Call| async move { Ok::<_, HandlerError>("shadow") }),
            )
            .unwrap();
        registry
            .register(
                "divide",
                "am.math.divide",
                Arc::new(|call: Call| async move {
                    let a: f64 = call.arg(0)?;
                    let b: f64 = call.arg(1)?;
                    if b == 0.0 {
                        return Err(HandlerError::failed("division by zero"));
                    }
                    Ok(a / b)
                }),
            )
            .unwrap();
        registry
            .register(
                "explode",
                "am.math.explode",
                Arc::new(|_call: Call| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok::<_, HandlerError>(())
                }),
            )
            .unwrap();
        Dispatcher::new(Arc::new(registry), Arc::new(JsonCodec), kind)
    }

    fn delivery(routing_key: &str, body: Value, reply: bool) -> Delivery {
        Delivery {
            delivery_tag: 7,
            exchange: "am_exchange_topic".to_string(),
            routing_key: routing_key.to_string(),
            properties: if reply {
                MessageProperties::reply("reply-q", "corr-1")
            } else {
                MessageProperties::default()
            },
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn reply_value(completion: &Completion) -> Value {
        let reply = completion.reply.as_ref().expect("reply expected");
        serde_json::from_slice(&reply.body).unwrap()
    }

    #[tokio::test]
    async fn test_reply_carries_correlation() {
        let completion = dispatcher(ExchangeKind::Topic)
            .handle(delivery("am.ping", json!({}), true))
            .await;
        assert_eq!(completion.delivery_tag, 7);
        assert!(completion.ack);
        let reply = completion.reply.as_ref().unwrap();
        assert_eq!(reply.reply_to, "reply-q");
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(reply_value(&completion), json!("pong"));
    }

    #[tokio::test]
    async fn test_first_match_handles() {
        let d = dispatcher(ExchangeKind::Topic);
        let completion = d.handle(delivery("am.ping", json!({}), true)).await;
        assert_eq!(reply_value(&completion), json!("pong"));
        let completion = d.handle(delivery("am.pong", json!({}), true)).await;
        assert_eq!(reply_value(&completion), json!("shadow"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_reply() {
        let completion = dispatcher(ExchangeKind::Topic)
            .handle(delivery("am.math.divide", json!({"args": [1, 0]}), true))
            .await;
        assert!(completion.ack);
        assert_eq!(reply_value(&completion), json!({"error": "division by zero"}));
    }

    #[tokio::test]
    async fn test_panic_becomes_reply() {
        let completion = dispatcher(ExchangeKind::Topic)
            .handle(delivery("am.math.explode", json!({}), true))
            .await;
        assert!(completion.ack);
        assert_eq!(
            reply_value(&completion),
            json!({"error": "handler panicked: kaboom"})
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_acked_with_error() {
        let d = dispatcher(ExchangeKind::Topic);
        let mut bad = delivery("am.ping", json!({}), true);
        bad.body = b"{not json".to_vec();
        let completion = d.handle(bad).await;
        assert!(completion.ack);
        assert!(reply_value(&completion).get("error").is_some());
    }

    #[tokio::test]
    async fn test_unmatched_topic_is_acked_without_reply() {
        let completion = dispatcher(ExchangeKind::Topic)
            .handle(delivery("other.key", json!({}), true))
            .await;
        assert!(completion.ack);
        assert!(completion.reply.is_none());
    }

    #[tokio::test]
    async fn test_fanout_is_never_acked() {
        let d = dispatcher(ExchangeKind::Fanout);
        let completion = d.handle(delivery("am.ping", json!({}), false)).await;
        assert!(!completion.ack);
        assert!(completion.reply.is_none());
        let completion = d.handle(delivery("other.key", json!({}), false)).await;
        assert!(!completion.ack);
    }

    #[tokio::test]
    async fn test_no_reply_without_reply_to() {
        let completion = dispatcher(ExchangeKind::Topic)
            .handle(delivery("am.ping", json!({}), false))
            .await;
        assert!(completion.ack);
        assert!(completion.reply.is_none());
    }

    struct RefusingCodec;

    impl Codec for RefusingCodec {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn encode(&self, _value: &Value) -> Result<Vec<u8>> {
            Err(AmrpcError::Codec("cannot encode".into()))
        }

        fn decode(&self, data: &[u8]) -> Result<Value> {
            JsonCodec.decode(data)
        }
    }

    #[tokio::test]
    async fn test_reply_encoding_failure_falls_back() {
        let d = dispatcher(ExchangeKind::Topic);
        let d = Dispatcher::new(d.registry.clone(), Arc::new(RefusingCodec), ExchangeKind::Topic);
        let completion = d.handle(delivery("am.ping", json!({}), true)).await;
        assert!(completion.ack);
        assert_eq!(reply_value(&completion), json!({"error": "failed to encode result"}));
    }

    struct PanickingCodec;

    impl Codec for PanickingCodec {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn encode(&self, value: &Value) -> Result<Vec<u8>> {
            JsonCodec.encode(value)
        }

        fn decode(&self, _data: &[u8]) -> Result<Value> {
            panic!("decoder bug")
        }
    }

    #[tokio::test]
    async fn test_guarded_dispatch_acks_after_panic_outside_handler() {
        let d = dispatcher(ExchangeKind::Topic);
        let d = Dispatcher::new(d.registry.clone(), Arc::new(PanickingCodec), ExchangeKind::Topic);
        let completion = d
            .handle_guarded(delivery("am.ping", json!({}), true))
            .await;
        assert_eq!(completion.delivery_tag, 7);
        assert!(completion.ack);
        assert_eq!(
            reply_value(&completion),
            json!({"error": "handler panicked: decoder bug"})
        );
        let reply = completion.reply.as_ref().unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
    }
}
