use amrpc_common::protocol::error::{AmrpcError, Result};
use amrpc_common::transport::{Channel, Connection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Channel pool configuration.
///
/// # Default Configuration
///
/// - `max_channels`: 10
/// - `acquire_timeout_ms`: 30000 (30 seconds)
///
/// # Example
///
/// ```rust
/// use amrpc_client::PoolConfig;
///
/// // Up to 20 concurrent calls, give up waiting for a channel after a minute
/// let config = PoolConfig {
///     max_channels: 20,
///     acquire_timeout_ms: 60000,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of channels checked out at once
    pub max_channels: usize,
    /// Maximum time to wait for a free channel in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels: 10,
            acquire_timeout_ms: 30000,
        }
    }
}

/// Pool of channels multiplexed over one connection.
///
/// Every call checks out its own channel, so no two tasks ever drive the
/// same channel. Idle channels are reused LIFO; broken ones are closed
/// instead of returned.
///
/// # Lifecycle
///
/// - [`acquire`](Self::acquire): check out a channel, waiting up to
///   `acquire_timeout_ms` when `max_channels` are in use
/// - [`drain`](Self::drain): stop handing out channels and wait for the
///   checked-out ones to come back
/// - [`close`](Self::close): stop handing out channels and close idle ones
pub struct ChannelPool {
    connection: Arc<dyn Connection>,
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Arc<dyn Channel>>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl PoolInner {
    fn take_idle(&self) -> Vec<Arc<dyn Channel>> {
        std::mem::take(&mut *self.idle.lock())
    }
}

impl ChannelPool {
    pub fn new(connection: Arc<dyn Connection>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_channels));
        Self {
            connection,
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                permits,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out a channel, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// - [`AmrpcError::PoolTimeout`] if no channel frees up in time
    /// - [`AmrpcError::PoolClosed`] after [`drain`](Self::drain) or [`close`](Self::close)
    /// - a transport error if a new channel cannot be opened
    pub async fn acquire(&self) -> Result<PooledChannel> {
        if self.is_closed() {
            return Err(AmrpcError::PoolClosed);
        }

        let timeout_ms = self.inner.config.acquire_timeout_ms;
        let permit = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| AmrpcError::PoolTimeout(timeout_ms))?
        .map_err(|_| AmrpcError::PoolClosed)?;

        if self.is_closed() {
            return Err(AmrpcError::PoolClosed);
        }

        let channel = loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(channel) if channel.is_open() => break channel,
                Some(_) => {
                    tracing::debug!("Removing closed channel from pool");
                }
                None => break self.connection.open_channel().await?,
            }
        };

        Ok(PooledChannel {
            channel,
            pool: self.inner.clone(),
            reusable: true,
            _permit: permit,
        })
    }

    /// Number of idle channels ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of channels currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner
            .config
            .max_channels
            .saturating_sub(self.inner.permits.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops new acquisitions and waits until every checked-out channel has
    /// been returned, then closes the idle channels.
    pub async fn drain(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let all = u32::try_from(self.inner.config.max_channels)
            .map_err(|_| AmrpcError::InvalidConfig("max_channels is too large".to_string()))?;
        if all > 0 {
            let _permits = self
                .inner
                .permits
                .acquire_many(all)
                .await
                .map_err(|_| AmrpcError::PoolClosed)?;
        }
        self.close_idle().await;
        Ok(())
    }

    /// Stops new acquisitions and closes idle channels. Channels still
    /// checked out are closed when they are returned.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        self.close_idle().await;
    }

    async fn close_idle(&self) {
        for channel in self.inner.take_idle() {
            if let Err(e) = channel.close().await {
                tracing::debug!("Error closing pooled channel: {}", e);
            }
        }
    }
}

/// A channel checked out of a [`ChannelPool`].
///
/// Returned to the pool on drop unless it was [discarded](Self::discard),
/// marked not reusable, or has closed in the meantime.
pub struct PooledChannel {
    channel: Arc<dyn Channel>,
    pool: Arc<PoolInner>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    /// Marks whether the channel may go back to the pool on drop.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Drops the channel without returning it to the pool.
    pub fn discard(mut self) {
        self.reusable = false;
    }
}

impl Deref for PooledChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let closed = self.pool.closed.load(Ordering::Acquire);
        if self.reusable && !closed && self.channel.is_open() {
            self.pool.idle.lock().push(self.channel.clone());
            return;
        }
        if !self.channel.is_open() {
            return;
        }
        let channel = self.channel.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = channel.close().await {
                    tracing::debug!("Error closing discarded channel: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrpc_common::transport::{Connector, MemoryBroker};
    use amrpc_common::BrokerConfig;

    async fn pool(config: PoolConfig) -> (MemoryBroker, ChannelPool) {
        let broker = MemoryBroker::new();
        let connection = broker
            .connector()
            .connect(&BrokerConfig::default())
            .await
            .unwrap();
        (broker, ChannelPool::new(connection, config))
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_channels, 10);
        assert_eq!(config.acquire_timeout_ms, 30000);
    }

    #[tokio::test]
    async fn test_released_channels_are_reused() {
        let (_broker, pool) = pool(PoolConfig::default()).await;
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(first);
        drop(second);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 2);

        let _again = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_discarded_channels_are_not_reused() {
        let (_broker, pool) = pool(PoolConfig::default()).await;
        let channel = pool.acquire().await.unwrap();
        channel.discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_channels_are_skipped() {
        let (_broker, pool) = pool(PoolConfig::default()).await;
        let channel = pool.acquire().await.unwrap();
        channel.close().await.unwrap();
        drop(channel);
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.acquire().await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_pool_timeout() {
        let (_broker, pool) = pool(PoolConfig {
            max_channels: 1,
            acquire_timeout_ms: 50,
        })
        .await;
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(AmrpcError::PoolTimeout(50))));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_channel() {
        let (_broker, pool) = pool(PoolConfig {
            max_channels: 1,
            acquire_timeout_ms: 1000,
        })
        .await;
        let held = pool.acquire().await.unwrap();
        let release = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        };
        let (acquired, _) = tokio::join!(pool.acquire(), release);
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let (_broker, pool) = pool(PoolConfig::default()).await;
        drop(pool.acquire().await.unwrap());
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.acquire().await, Err(AmrpcError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_drain_waits_for_checked_out_channels() {
        let (_broker, pool) = pool(PoolConfig {
            max_channels: 2,
            acquire_timeout_ms: 1000,
        })
        .await;
        let held = pool.acquire().await.unwrap();
        let release = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        };
        let (drained, _) = tokio::join!(pool.drain(), release);
        drained.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.acquire().await, Err(AmrpcError::PoolClosed)));
    }
}
