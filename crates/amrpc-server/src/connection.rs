//! Connection setup for the server side.

use amrpc_common::transport::{
    Channel, Connection, Connector, DeliveryStream, ExchangeKind, QueueOptions,
};
use amrpc_common::{Naming, Result};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::endpoint::EndpointRegistry;

/// A live connection with its channel, bound queue and consumer.
pub(crate) struct Session {
    pub connection: Arc<dyn Connection>,
    pub channel: Arc<dyn Channel>,
    pub queue: String,
    pub deliveries: DeliveryStream,
}

impl Session {
    /// Closes the channel and the connection, ignoring failures.
    pub async fn close(self) {
        drop(self.deliveries);
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Error closing channel: {}", e);
        }
        if let Err(e) = self.connection.close().await {
            tracing::debug!("Error closing connection: {}", e);
        }
    }
}

/// Connects, declares the exchange, applies prefetch, declares the service
/// queue and binds it to every registered routing key.
pub(crate) async fn establish(
    connector: &dyn Connector,
    config: &ServerConfig,
    naming: &Naming,
    registry: &EndpointRegistry,
) -> Result<Session> {
    let connection = connector.connect(&config.broker).await?;
    match declare(connection.clone(), config, naming, registry).await {
        Ok(session) => Ok(session),
        Err(e) => {
            let _ = connection.close().await;
            Err(e)
        }
    }
}

async fn declare(
    connection: Arc<dyn Connection>,
    config: &ServerConfig,
    naming: &Naming,
    registry: &EndpointRegistry,
) -> Result<Session> {
    let kind = config.service.exchange_kind;
    let exchange = naming.exchange_name(kind);

    let channel = connection.open_channel().await?;
    channel.declare_exchange(&exchange, kind).await?;
    channel.set_prefetch(config.prefetch_count).await?;

    let options = match kind {
        ExchangeKind::Topic => QueueOptions::durable(naming.queue_name(kind)),
        ExchangeKind::Fanout => QueueOptions::exclusive(),
    };
    let queue = channel.declare_queue(options).await?;

    for routing_key in registry.binding_keys() {
        channel.bind_queue(&queue, &exchange, routing_key).await?;
    }

    let deliveries = channel.consume(&queue, kind.ack_mode()).await?;
    tracing::debug!(
        "Consuming from {} bound to {} with {} routing keys",
        queue,
        exchange,
        registry.binding_keys().len()
    );

    Ok(Session {
        connection,
        channel,
        queue,
        deliveries,
    })
}
