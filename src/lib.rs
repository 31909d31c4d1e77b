//! # amrpc
//!
//! Lightweight RPC over an AMQP message broker.
//!
//! A [`Server`] binds endpoint patterns under a service namespace and replies
//! to each request on the caller's private reply queue. A [`Client`] makes
//! calls that wait for that reply (bounded by a timeout) or publishes
//! fire-and-forget messages.
//!
//! The member crates are re-exported as [`common`], [`client`] and
//! [`server`]; the most used types are also available at the top level.
//!
//! ```no_run
//! use amrpc::{Call, Client, ClientConfig, Envelope, HandlerError, Server, ServerConfig, ServiceConfig};
//! use amrpc::common::transport::AmqpConnector;
//!
//! async fn ping(_call: Call) -> Result<&'static str, HandlerError> {
//!     Ok("pong")
//! }
//!
//! # async fn example() -> amrpc::Result<()> {
//! let mut server = Server::new(ServerConfig::new(ServiceConfig::new("am", "demo")), AmqpConnector::new())?;
//! server.register_endpoint("ping", ping)?;
//! let handle = server.spawn();
//!
//! let client = Client::connect(ClientConfig::new(ServiceConfig::new("am", "demo")), AmqpConnector::new()).await?;
//! assert_eq!(client.call("ping", Envelope::new()).await?, "pong");
//!
//! client.close().await;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub use amrpc_client as client;
pub use amrpc_common as common;
pub use amrpc_server as server;

pub use amrpc_client::{CallOptions, Client, ClientConfig};
pub use amrpc_common::{AmrpcError, BrokerConfig, Envelope, Result, RetryConfig, ServiceConfig};
pub use amrpc_server::{
    Call, DispatchMode, HandlerError, Server, ServerConfig, ServerHandle, ServerState,
};
