//! AMRPC Server
//!
//! [`Server`] owns the endpoint registry and the receive loop. `run` walks
//! the state machine
//!
//! ```text
//! Init -> Connecting -> Consuming --(transport error)--> Reconnecting -> Connecting
//!                       Consuming --(shutdown)--> Closed
//! ```
//!
//! Reconnects wait with exponential backoff from [`RetryConfig`] and give
//! up with [`AmrpcError::ReconnectExhausted`] once `max_attempts`
//! consecutive connection attempts have failed.
//!
//! [`RetryConfig`]: amrpc_common::RetryConfig

use amrpc_common::transport::{
    Channel, Codec, Connector, JsonCodec, MessageProperties, DEFAULT_EXCHANGE,
};
use amrpc_common::{AmrpcError, Naming, Result};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchMode, ServerConfig};
use crate::connection::{self, Session};
use crate::dispatch::{Completion, Dispatcher};
use crate::endpoint::EndpointRegistry;
use crate::handler::Handler;

/// Lifecycle state of a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Connecting,
    Consuming,
    /// Waiting before connection attempt number `attempt`
    Reconnecting { attempt: u32 },
    Closed,
}

/// An RPC server bound to one service namespace.
///
/// Endpoints are registered up front; [`run`](Server::run) consumes the
/// server, so the registry cannot change once consuming has started.
///
/// # Example
///
/// ```
/// use amrpc_common::transport::MemoryBroker;
/// use amrpc_common::ServiceConfig;
/// use amrpc_server::{Call, HandlerError, Server, ServerConfig};
///
/// let broker = MemoryBroker::new();
/// let config = ServerConfig::new(ServiceConfig::new("am", "math"));
/// let mut server = Server::new(config, broker.connector()).unwrap();
///
/// server
///     .register_endpoint("ping", |_call: Call| async move {
///         Ok::<_, HandlerError>("pong")
///     })
///     .unwrap();
///
/// assert_eq!(server.registry().len(), 1);
/// assert!(server.registry().resolve("am.math.ping").is_some());
/// ```
pub struct Server {
    config: ServerConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    naming: Naming,
    registry: EndpointRegistry,
    state: watch::Sender<ServerState>,
}

impl Server {
    pub fn new(config: ServerConfig, connector: impl Connector) -> Result<Self> {
        config.service.validate()?;
        let naming = config.service.naming();
        let (state, _) = watch::channel(ServerState::Init);
        Ok(Self {
            config,
            connector: Arc::new(connector),
            codec: Arc::new(JsonCodec),
            naming,
            registry: EndpointRegistry::new(),
            state,
        })
    }

    /// Replaces the default JSON codec.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Registers `handler` under the service's routing key for `key`.
    ///
    /// `key` may contain whole-segment `*` wildcards. Registration order
    /// decides which endpoint handles a key matched by several patterns.
    pub fn register_endpoint<H: Handler>(&mut self, key: &str, handler: H) -> Result<&mut Self> {
        let routing_key = self.naming.routing_key(key);
        self.registry.register(key, &routing_key, Arc::new(handler))?;
        Ok(self)
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let state = self.state();
        let task = tokio::spawn(self.run(shutdown.clone()));
        ServerHandle {
            shutdown,
            state,
            task,
        }
    }

    /// Connects, consumes and reconnects until `shutdown` is cancelled.
    ///
    /// Returns `Ok(())` after a clean shutdown and
    /// [`AmrpcError::ReconnectExhausted`] when the retry limit is reached.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Server {
            config,
            connector,
            codec,
            naming,
            registry,
            state,
        } = self;

        if registry.is_empty() {
            tracing::warn!("Starting server with no registered endpoints");
        }
        tracing::info!(
            "Starting {} server for '{}' with {} endpoints ({} dispatch, codec {})",
            config.service.exchange_kind,
            naming.routing_key(""),
            registry.len(),
            match config.dispatch {
                DispatchMode::Inline => "inline",
                DispatchMode::Concurrent => "concurrent",
            },
            codec.name()
        );

        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(registry.clone(), codec, config.service.exchange_kind);
        // Consecutive failed connection attempts, for the retry limit
        let mut failures: u32 = 0;
        // Reconnect attempt number, for backoff and state reporting
        let mut attempt: u32 = 0;

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            state.send_replace(ServerState::Connecting);

            let established = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                session = connection::establish(connector.as_ref(), &config, &naming, &registry) => session,
            };

            match established {
                Ok(session) => {
                    failures = 0;
                    attempt = 0;
                    state.send_replace(ServerState::Consuming);
                    tracing::info!(
                        "Consuming from {} at {}",
                        session.queue,
                        config.broker.address()
                    );
                    match consume(session, &dispatcher, &config, &shutdown).await {
                        Ok(()) => break Ok(()),
                        Err(e) => tracing::error!("Connection to broker lost: {}", e),
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        "Failed to connect to broker at {} (attempt {}): {}",
                        config.broker.address(),
                        failures,
                        e
                    );
                    if !config.retry.allows(failures + 1) {
                        break Err(AmrpcError::ReconnectExhausted(failures));
                    }
                }
            }

            attempt += 1;
            let delay = config.retry.backoff_for(attempt);
            state.send_replace(ServerState::Reconnecting { attempt });
            tracing::warn!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        state.send_replace(ServerState::Closed);
        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::error!("Server gave up: {}", e),
        }
        result
    }
}

/// The receive loop for one session.
///
/// Returns `Ok(())` on shutdown and the transport error otherwise. The
/// session is closed in both cases.
async fn consume(
    mut session: Session,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    let channel = session.channel.clone();
    let mut in_flight: JoinSet<Completion> = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break Ok(()),

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                Ok(completion) => {
                    if let Err(e) = complete(channel.as_ref(), completion).await {
                        break Err(e);
                    }
                }
                // Panics are caught in dispatch, so only aborted tasks land here
                Err(e) => tracing::error!("Handler task failed: {}", e),
            },

            next = session.deliveries.next() => {
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => break Err(e),
                    None => break Err(AmrpcError::Transport("delivery stream ended".to_string())),
                };
                tracing::debug!(
                    "Received message {} with routing key {}",
                    delivery.delivery_tag,
                    delivery.routing_key
                );
                match config.dispatch {
                    DispatchMode::Inline => {
                        let handling = dispatcher.handle_guarded(delivery);
                        match handle_inline(handling, shutdown, config.shutdown_grace()).await {
                            Some(completion) => {
                                if let Err(e) = complete(channel.as_ref(), completion).await {
                                    break Err(e);
                                }
                            }
                            // Unacked, so the broker requeues it with the channel
                            None => break Ok(()),
                        }
                    }
                    DispatchMode::Concurrent => {
                        let dispatcher = dispatcher.clone();
                        in_flight.spawn(async move { dispatcher.handle_guarded(delivery).await });
                    }
                }
            }
        }
    };

    match outcome {
        Ok(()) => drain(&mut in_flight, channel.as_ref(), config.shutdown_grace()).await,
        Err(_) if !in_flight.is_empty() => {
            // Their deliveries go back to the queue with the lost channel
            tracing::warn!("Abandoning {} in-flight handlers", in_flight.len());
            in_flight.abort_all();
        }
        Err(_) => {}
    }

    session.close().await;
    outcome
}

/// Runs one inline dispatch. Once `shutdown` fires the handler gets `grace`
/// to finish; `None` means it was abandoned.
async fn handle_inline(
    handling: impl Future<Output = Completion>,
    shutdown: &CancellationToken,
    grace: Duration,
) -> Option<Completion> {
    tokio::pin!(handling);
    tokio::select! {
        completion = &mut handling => return Some(completion),
        _ = shutdown.cancelled() => {}
    }

    tracing::info!("Waiting for the in-flight handler");
    match tokio::time::timeout(grace, handling).await {
        Ok(completion) => Some(completion),
        Err(_) => {
            tracing::warn!("Shutdown grace period elapsed, abandoning the in-flight handler");
            None
        }
    }
}

/// Waits up to `grace` for in-flight handlers and applies their completions.
async fn drain(in_flight: &mut JoinSet<Completion>, channel: &dyn Channel, grace: Duration) {
    if in_flight.is_empty() {
        return;
    }
    tracing::info!("Waiting for {} in-flight handlers", in_flight.len());
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    while !in_flight.is_empty() {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!(
                    "Shutdown grace period elapsed, abandoning {} handlers",
                    in_flight.len()
                );
                in_flight.abort_all();
                return;
            }
            Some(joined) = in_flight.join_next() => {
                if let Ok(completion) = joined {
                    if let Err(e) = complete(channel, completion).await {
                        tracing::warn!("Failed to complete message during shutdown: {}", e);
                    }
                }
            }
        }
    }
}

/// Acknowledges the delivery, then publishes the reply.
///
/// Only the task owning the session's channel calls this.
async fn complete(channel: &dyn Channel, completion: Completion) -> Result<()> {
    if completion.ack {
        channel.ack(completion.delivery_tag).await?;
    }
    if let Some(reply) = completion.reply {
        let properties = MessageProperties {
            reply_to: None,
            correlation_id: reply.correlation_id,
        };
        match channel
            .publish(DEFAULT_EXCHANGE, &reply.reply_to, properties, reply.body)
            .await
        {
            Ok(()) => tracing::debug!("Replied to {}", reply.reply_to),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => tracing::warn!("Failed to publish reply to {}: {}", reply.reply_to, e),
        }
    }
    Ok(())
}

/// Handle to a server running on a background task.
pub struct ServerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ServerState>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Current state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `predicate`.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ServerState) -> bool,
    ) -> Result<ServerState> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(predicate)
            .await
            .map(|state| *state)
            .map_err(|_| AmrpcError::Transport("server task has ended".to_string()))?;
        Ok(reached)
    }

    /// Signals the server to stop without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the server and waits for it to close.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Waits for the server to finish on its own.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| AmrpcError::Transport(format!("server task failed: {}", e)))?
    }
}
