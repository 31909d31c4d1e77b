//! RabbitMQ transport over lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AckMode, Channel, Connection, Connector, Delivery, DeliveryStream, ExchangeKind,
    MessageProperties, QueueOptions,
};
use crate::config::BrokerConfig;
use crate::protocol::error::{AmrpcError, Result};

const CLOSE_OK: u16 = 200;

/// Connects to an AMQP 0-9-1 broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| AmrpcError::Connection(format!("{}: {}", config.address(), e)))?;
        tracing::debug!("Connected to AMQP broker at {}", config.address());
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            self.inner.close(CLOSE_OK, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, options: QueueOptions) -> Result<String> {
        let queue = self
            .inner
            .queue_declare(
                &options.name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream> {
        let consumer_tag = format!("amrpc-{}", Uuid::new_v4().simple());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|result| -> Result<Delivery> {
            let delivery = result?;
            Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                properties: MessageProperties {
                    reply_to: short_string(delivery.properties.reply_to()),
                    correlation_id: short_string(delivery.properties.correlation_id()),
                },
                body: delivery.data,
            })
        });
        Ok(Box::pin(deliveries))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut amqp_properties = BasicProperties::default();
        if let Some(reply_to) = properties.reply_to {
            amqp_properties = amqp_properties.with_reply_to(reply_to.into());
        }
        if let Some(correlation_id) = properties.correlation_id {
            amqp_properties = amqp_properties.with_correlation_id(correlation_id.into());
        }
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                amqp_properties,
            )
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_open() {
            self.inner.close(CLOSE_OK, "OK").await?;
        }
        Ok(())
    }
}
