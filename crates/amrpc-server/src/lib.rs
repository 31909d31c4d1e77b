//! AMRPC Server
//!
//! This crate provides the server side of amrpc: an ordered endpoint
//! registry, the broker receive loop with inline or concurrent dispatch,
//! acknowledgment and reply publication, and reconnection with backoff.

mod connection;
mod dispatch;

pub mod config;
pub mod endpoint;
pub mod handler;
pub mod server;

pub use config::{DispatchMode, ServerConfig};
pub use endpoint::{Endpoint, EndpointRegistry};
pub use handler::{Call, Handler, HandlerError, HandlerResult};
pub use server::{Server, ServerHandle, ServerState};
