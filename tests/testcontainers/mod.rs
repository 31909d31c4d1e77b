//! Testcontainers utilities for AMRPC integration tests.
//!
//! Starts a throwaway RabbitMQ broker in Docker and hands out the matching
//! [`BrokerConfig`].

use amrpc::BrokerConfig;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage,
};

const AMQP_PORT: u16 = 5672;

/// Wrapper for a running RabbitMQ container.
pub struct RabbitContainer {
    #[allow(dead_code)]
    container: ContainerAsync<GenericImage>,
    /// The host port mapped to the container's AMQP port.
    pub host_port: u16,
}

impl RabbitContainer {
    /// Start RabbitMQ and wait until it accepts connections.
    pub async fn start() -> anyhow::Result<Self> {
        let image = GenericImage::new("rabbitmq", "3.13-alpine")
            .with_exposed_port(AMQP_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

        let container = image.start().await?;
        let host_port = container.get_host_port_ipv4(AMQP_PORT).await?;

        Ok(Self {
            container,
            host_port,
        })
    }

    /// Broker settings for the default `guest` account.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: self.host_port,
            ..BrokerConfig::default()
        }
    }
}
