use amrpc_common::protocol::{CorrelationId, Envelope, ErrorReply, RpcResult};
use amrpc_common::transport::{
    AckMode, Codec, Connection, Connector, JsonCodec, MessageProperties, QueueOptions,
};
use amrpc_common::{AmrpcError, BrokerConfig, Naming, Result, ServiceConfig};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pool::{ChannelPool, PoolConfig, PooledChannel};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub broker: BrokerConfig,
    pub service: ServiceConfig,
    /// Default deadline for [`Client::call`] in milliseconds
    ///
    /// Default: 5000ms
    pub timeout_ms: u64,
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            service: ServiceConfig::default(),
            timeout_ms: 5000,
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
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

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Per-call overrides for [`Client::call_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Bound on the whole call, from channel checkout to reply; the
    /// client's `timeout_ms` when unset
    pub timeout: Option<Duration>,
    /// Abandons the call when cancelled
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// The deadline and cancellation token one call runs under.
struct CallBudget {
    timeout: Duration,
    deadline: Instant,
    cancel: Option<CancellationToken>,
}

impl CallBudget {
    fn new(timeout: Duration, cancel: Option<CancellationToken>) -> Self {
        let now = Instant::now();
        // Out-of-range timeouts fall back to roughly thirty years
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30));
        Self {
            timeout,
            deadline,
            cancel,
        }
    }

    fn timeout_error(&self) -> AmrpcError {
        AmrpcError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
    }

    /// Runs one step of the call. Cancellation wins over a ready step.
    async fn run<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(AmrpcError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, step) => {
                result.map_err(|_| self.timeout_error())?
            }
        }
    }
}

/// AMRPC client for making RPC calls
///
/// Each call checks out its own channel from the client's pool and
/// declares its own exclusive reply queue, so concurrent calls on one
/// client never see each other's replies.
///
/// # Example
///
/// ```no_run
/// use amrpc_client::{Client, ClientConfig};
/// use amrpc_common::transport::AmqpConnector;
/// use amrpc_common::{Envelope, ServiceConfig};
///
/// # async fn example() -> amrpc_common::Result<()> {
/// let config = ClientConfig::new(ServiceConfig::new("am", "math"));
/// let client = Client::connect(config, AmqpConnector::new()).await?;
///
/// let quotient: f64 = client
///     .call_as("divide", Envelope::new().arg(10).arg(4))
///     .await?;
/// assert_eq!(quotient, 2.5);
///
/// client.publish("audit", Envelope::new().kwarg("event", "divided")).await?;
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    naming: Naming,
    exchange: String,
    connection: Arc<dyn Connection>,
    pool: ChannelPool,
    codec: Arc<dyn Codec>,
}

impl Client {
    /// Connects to the broker and declares the service exchange.
    pub async fn connect(config: ClientConfig, connector: impl Connector) -> Result<Self> {
        config.service.validate()?;
        let naming = config.service.naming();
        let kind = config.service.exchange_kind;
        let exchange = naming.exchange_name(kind);

        let connection = connector.connect(&config.broker).await?;
        let pool = ChannelPool::new(connection.clone(), config.pool.clone());
        {
            let channel = pool.acquire().await?;
            channel.declare_exchange(&exchange, kind).await?;
        }
        tracing::info!(
            "Client connected to {} using exchange {}",
            config.broker.address(),
            exchange
        );

        Ok(Self {
            config,
            naming,
            exchange,
            connection,
            pool,
            codec: Arc::new(JsonCodec),
        })
    }

    /// Replaces the default JSON codec.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Full routing key for a method key.
    pub fn routing_key(&self, key: &str) -> String {
        self.naming.routing_key(key)
    }

    /// Calls `key` and waits up to the configured timeout for the reply.
    ///
    /// An error-shaped reply is returned as a value; use
    /// [`call_as`](Self::call_as) to turn it into an error.
    pub async fn call(&self, key: &str, envelope: Envelope) -> Result<RpcResult> {
        self.call_with(key, envelope, CallOptions::default()).await
    }

    /// Calls `key` with a per-call timeout and cancellation token.
    ///
    /// The timeout bounds the whole call, including waiting for a free
    /// channel. Nothing is published once `options.cancel` has fired.
    ///
    /// # Errors
    ///
    /// - [`AmrpcError::Timeout`] if no matching reply arrives in time
    /// - [`AmrpcError::Cancelled`] if `options.cancel` fires first
    /// - transport and pool errors
    pub async fn call_with(
        &self,
        key: &str,
        envelope: Envelope,
        options: CallOptions,
    ) -> Result<RpcResult> {
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.timeout_ms));
        let budget = CallBudget::new(timeout, options.cancel);
        let routing_key = self.routing_key(key);
        let body = envelope.encode(self.codec.as_ref())?;

        let result = async {
            let mut channel = budget.run(self.pool.acquire()).await?;
            // Reusable again only once the reply queue is cleaned up
            channel.set_reusable(false);
            self.exchange_call(&mut channel, &routing_key, body, &budget)
                .await
        }
        .await;
        if let Err(e) = &result {
            tracing::debug!("Call to {} failed: {}", routing_key, e);
        }
        result
    }

    /// Calls `key` and deserializes the reply into `T`.
    ///
    /// An error-shaped reply becomes [`AmrpcError::Remote`].
    pub async fn call_as<T: DeserializeOwned>(&self, key: &str, envelope: Envelope) -> Result<T> {
        let value = self.call(key, envelope).await?;
        if let Some(reply) = ErrorReply::from_value(&value) {
            return Err(AmrpcError::Remote(reply.error));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Publishes to `key` without a reply address and returns immediately.
    pub async fn publish(&self, key: &str, envelope: Envelope) -> Result<()> {
        let routing_key = self.routing_key(key);
        let body = envelope.encode(self.codec.as_ref())?;
        let channel = self.pool.acquire().await?;
        match channel
            .publish(&self.exchange, &routing_key, MessageProperties::default(), body)
            .await
        {
            Ok(()) => {
                tracing::debug!("Published to {}", routing_key);
                Ok(())
            }
            Err(e) => {
                if e.is_transport() {
                    channel.discard();
                }
                Err(e)
            }
        }
    }

    /// Closes the channel pool and the connection.
    pub async fn close(&self) {
        self.pool.close().await;
        if let Err(e) = self.connection.close().await {
            tracing::debug!("Error closing connection: {}", e);
        }
        tracing::info!("Client closed");
    }

    async fn exchange_call(
        &self,
        channel: &mut PooledChannel,
        routing_key: &str,
        body: Vec<u8>,
        budget: &CallBudget,
    ) -> Result<RpcResult> {
        let reply_queue = budget
            .run(channel.declare_queue(QueueOptions::exclusive()))
            .await?;
        let correlation_id = CorrelationId::new();

        let outcome = budget
            .run(async {
                let mut replies = channel.consume(&reply_queue, AckMode::Auto).await?;
                channel
                    .publish(
                        &self.exchange,
                        routing_key,
                        MessageProperties::reply(reply_queue.as_str(), correlation_id.as_str()),
                        body,
                    )
                    .await?;
                tracing::debug!("Called {} ({})", routing_key, correlation_id);

                while let Some(delivery) = replies.next().await {
                    let delivery = delivery?;
                    if correlation_id.matches(delivery.properties.correlation_id.as_deref()) {
                        return self.codec.decode(&delivery.body);
                    }
                    tracing::debug!(
                        "Discarding reply with unexpected correlation id {:?}",
                        delivery.properties.correlation_id
                    );
                }
                Err(AmrpcError::Transport("reply consumer ended".to_string()))
            })
            .await;

        match channel.delete_queue(&reply_queue).await {
            Ok(()) => {
                if !matches!(&outcome, Err(e) if e.is_transport()) {
                    channel.set_reusable(true);
                }
            }
            Err(e) => tracing::debug!("Failed to delete reply queue {}: {}", reply_queue, e),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.service.prefix, "am");
    }

    #[test]
    fn test_call_options() {
        let token = CancellationToken::new();
        let options = CallOptions::new()
            .with_timeout(Duration::from_millis(10))
            .with_cancel(token.clone());
        assert_eq!(options.timeout, Some(Duration::from_millis(10)));
        assert!(options.cancel.is_some());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"timeout_ms": 250, "service": {"service": "math"}}"#)
                .unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.service.prefix, "am");
        assert_eq!(config.service.service, "math");
        assert_eq!(config.broker.port, 5672);
    }

    #[tokio::test]
    async fn test_budget_cancelled_before_ready_step() {
        let token = CancellationToken::new();
        token.cancel();
        let budget = CallBudget::new(Duration::from_secs(5), Some(token));
        let result = budget.run(async { Ok(42) }).await;
        assert!(matches!(result, Err(AmrpcError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_deadline_spans_steps() {
        let budget = CallBudget::new(Duration::from_millis(100), None);
        budget
            .run(async {
                tokio::time::sleep(Duration::from_millis(70)).await;
                Ok(())
            })
            .await
            .unwrap();

        let second = budget
            .run(async {
                tokio::time::sleep(Duration::from_millis(70)).await;
                Ok(())
            })
            .await;
        assert!(matches!(second, Err(AmrpcError::Timeout(100))));
    }

    #[test]
    fn test_budget_timeout_saturates() {
        let budget = CallBudget::new(Duration::from_millis(250), None);
        assert!(matches!(budget.timeout_error(), AmrpcError::Timeout(250)));

        let budget = CallBudget::new(Duration::MAX, None);
        assert!(matches!(budget.timeout_error(), AmrpcError::Timeout(u64::MAX)));
    }
}
