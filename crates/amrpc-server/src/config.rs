use amrpc_common::{BrokerConfig, RetryConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the receive loop runs handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// The receive loop runs each handler to completion before reading on
    #[default]
    Inline,
    /// Each delivery is handled on its own task
    Concurrent,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub broker: BrokerConfig,
    pub service: ServiceConfig,
    /// Maximum unacknowledged deliveries held by the server's channel
    ///
    /// Default: 5
    pub prefetch_count: u16,
    pub dispatch: DispatchMode,
    pub retry: RetryConfig,
    /// How long shutdown waits for in-flight handlers
    ///
    /// Default: 5000ms
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            service: ServiceConfig::default(),
            prefetch_count: 5,
            dispatch: DispatchMode::Inline,
            retry: RetryConfig::default(),
            shutdown_grace_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            service,
            ..Default::default()
        }
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, shutdown_grace_ms: u64) -> Self {
        self.shutdown_grace_ms = shutdown_grace_ms;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
