//! AMRPC Client
//!
//! Synchronous calls with per-call reply queues and correlation ids, plus
//! fire-and-forget publishes, over an explicitly owned channel pool.

pub mod client;
pub mod pool;

pub use client::{CallOptions, Client, ClientConfig};
pub use pool::{ChannelPool, PoolConfig, PooledChannel};
