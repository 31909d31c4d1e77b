//! AMRPC Common Types and Transport
//!
//! This crate provides the protocol definitions, naming rules, topic matching
//! and broker transport layer shared by the amrpc client and server.
//!
//! # Overview
//!
//! amrpc is a lightweight RPC framework layered on a message broker. A client
//! publishes a request envelope to a topic (or fanout) exchange using a
//! routing key derived from a service namespace and a method key; a server
//! bound to that exchange dispatches the request to a registered endpoint and
//! publishes the result back to the caller's private reply queue, tagged with
//! the original correlation id.
//!
//! - **Protocol Layer**: request envelope, error-shaped replies, correlation ids, errors
//! - **Transport Layer**: broker traits with an AMQP (lapin) and an in-memory implementation
//! - **Naming / Topic**: exchange, queue and routing key derivation plus wildcard matching
//!
//! # Wire Format
//!
//! - **Request body**: `{"args": [...], "kwargs": {...}}`
//! - **Reply body**: the handler's return value, or `{"error": "<message>"}`
//! - **Serialization**: JSON by default, pluggable through [`transport::Codec`]
//!
//! # Example
//!
//! ```
//! use amrpc_common::{Envelope, Naming};
//! use amrpc_common::transport::{ExchangeKind, JsonCodec};
//! use serde_json::json;
//!
//! let naming = Naming::new("am", "math");
//! assert_eq!(naming.routing_key("divide"), "am.math.divide");
//! assert_eq!(naming.exchange_name(ExchangeKind::Topic), "am_exchange_topic");
//!
//! let envelope = Envelope::new().arg(1).arg(0).kwarg("precision", json!(2));
//! let bytes = envelope.encode(&JsonCodec).unwrap();
//! assert_eq!(Envelope::decode(&JsonCodec, &bytes).unwrap(), envelope);
//! ```

pub mod config;
pub mod naming;
pub mod protocol;
pub mod retry;
pub mod topic;
pub mod transport;

pub use config::{BrokerConfig, ServiceConfig};
pub use naming::Naming;
pub use protocol::*;
pub use retry::RetryConfig;
pub use topic::TopicPattern;
