//! AMRPC Transport Layer
//!
//! This module abstracts the message broker behind three object-safe traits
//! and provides the codecs used for message bodies.
//!
//! # Architecture
//!
//! - **[`Connector`]**: opens a [`Connection`] to a broker
//! - **[`Connection`]**: one transport connection, multiplexing [`Channel`]s
//! - **[`Channel`]**: declares exchanges and queues, binds, consumes,
//!   publishes and acknowledges
//!
//! Connections and channels are shared as `Arc<dyn Connection>` and
//! `Arc<dyn Channel>`. A channel is not meant to be driven from several
//! tasks at once; the server funnels every channel operation through the
//! task that owns it and the client checks out one channel per call.
//!
//! # Implementations
//!
//! - **[`AmqpConnector`]**: RabbitMQ over lapin (feature `amqp`, on by default)
//! - **[`MemoryBroker`]**: an in-process broker with the same routing,
//!   acknowledgment and prefetch semantics, used by tests and embedded setups
//!
//! # Example
//!
//! ```
//! use amrpc_common::BrokerConfig;
//! use amrpc_common::transport::{
//!     AckMode, Connector, ExchangeKind, MemoryBroker, MessageProperties, QueueOptions,
//! };
//! use futures::StreamExt;
//!
//! # tokio_test_runtime(async {
//! let broker = MemoryBroker::new();
//! let connection = broker.connector().connect(&BrokerConfig::default()).await.unwrap();
//! let channel = connection.open_channel().await.unwrap();
//!
//! channel.declare_exchange("am_exchange_topic", ExchangeKind::Topic).await.unwrap();
//! let queue = channel.declare_queue(QueueOptions::durable("am_queue_topic")).await.unwrap();
//! channel.bind_queue(&queue, "am_exchange_topic", "am.ping").await.unwrap();
//!
//! let mut deliveries = channel.consume(&queue, AckMode::Manual).await.unwrap();
//! channel
//!     .publish("am_exchange_topic", "am.ping", MessageProperties::default(), b"{}".to_vec())
//!     .await
//!     .unwrap();
//!
//! let delivery = deliveries.next().await.unwrap().unwrap();
//! assert_eq!(delivery.routing_key, "am.ping");
//! channel.ack(delivery.delivery_tag).await.unwrap();
//! # });
//! # fn tokio_test_runtime(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::protocol::error::{AmrpcError, Result};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod codec;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use codec::{Codec, JsonCodec};
pub use memory::{MemoryBroker, MemoryConnector};


/// Name of the broker's default exchange: publishing to it delivers
/// straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routing-key pattern matching
    Topic,
    /// Broadcast to every bound queue
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// Fanout deliveries are auto-acknowledged; everything else is acked by hand.
    pub fn ack_mode(&self) -> AckMode {
        match self {
            ExchangeKind::Topic => AckMode::Manual,
            ExchangeKind::Fanout => AckMode::Auto,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmrpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(AmrpcError::InvalidConfig(format!(
                "unsupported exchange kind '{}', expected 'topic' or 'fanout'",
                other
            ))),
        }
    }
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue name; empty asks the broker to generate one
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A named, durable, shared queue (the topic service queue).
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// An anonymous exclusive queue (fanout subscriptions and reply queues).
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Acknowledgment mode of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Every delivery must be acknowledged with [`Channel::ack`]
    Manual,
    /// Deliveries count as acknowledged once sent
    Auto,
}

/// The message properties amrpc uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl MessageProperties {
    pub fn reply(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Deliveries of one consumer. The stream yields an error (or ends) when
/// the underlying channel or connection fails.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Connection>>;
}

/// One transport connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a [`Connection`].
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Limits unacknowledged deliveries to manual-ack consumers of this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Declares a queue and returns its (possibly broker-assigned) name.
    async fn declare_queue(&self, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}
