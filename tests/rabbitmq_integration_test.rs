//! RabbitMQ Integration Tests
//!
//! Runs client and server through a real broker started with testcontainers.
//! Requires Docker, so the tests are ignored by default:
//!
//! ```bash
//! cargo test --test rabbitmq_integration_test -- --ignored
//! ```

mod testcontainers;

use amrpc::common::transport::AmqpConnector;
use amrpc::{
    AmrpcError, Call, CallOptions, Client, ClientConfig, DispatchMode, Envelope, HandlerError,
    RetryConfig, Server, ServerConfig, ServerHandle, ServerState, ServiceConfig,
};
use serde_json::{json, Value};
use std::time::Duration;

fn service() -> ServiceConfig {
    ServiceConfig::new("amrpc_it", "math")
}

async fn divide(call: Call) -> Result<f64, HandlerError> {
    let dividend: f64 = call.arg(0)?;
    let divisor: f64 = call.arg(1)?;
    if divisor == 0.0 {
        return Err(HandlerError::failed("division by zero"));
    }
    Ok(dividend / divisor)
}

async fn start_server(broker: &testcontainers::RabbitContainer) -> anyhow::Result<ServerHandle> {
    let config = ServerConfig::new(service())
        .with_broker(broker.broker_config())
        .with_dispatch(DispatchMode::Concurrent)
        .with_retry(RetryConfig::fixed(100).with_max_attempts(20));
    let mut server = Server::new(config, AmqpConnector::new())?;
    server
        .register_endpoint("ping", |_call: Call| async {
            Ok::<_, HandlerError>("pong")
        })?
        .register_endpoint("echo", |call: Call| async move {
            Ok::<_, HandlerError>(json!({ "args": call.args, "kwargs": call.kwargs }))
        })?
        .register_endpoint("divide", divide)?
        .register_endpoint("sleep", |call: Call| async move {
            let ms: u64 = call.arg(0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(ms)
        })?;

    let handle = server.spawn();
    tokio::time::timeout(
        Duration::from_secs(30),
        handle.wait_for_state(|s| *s == ServerState::Consuming),
    )
    .await??;
    Ok(handle)
}

async fn connect_client(broker: &testcontainers::RabbitContainer) -> anyhow::Result<Client> {
    let config = ClientConfig::new(service())
        .with_broker(broker.broker_config())
        .with_timeout_ms(5000);
    Ok(Client::connect(config, AmqpConnector::new()).await?)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rabbitmq_request_reply() -> anyhow::Result<()> {
    let broker = testcontainers::RabbitContainer::start().await?;
    let server = start_server(&broker).await?;
    let client = connect_client(&broker).await?;

    assert_eq!(client.call("ping", Envelope::new()).await?, json!("pong"));
    assert_eq!(
        client.call("divide", Envelope::new().arg(1).arg(0)).await?,
        json!({"error": "division by zero"})
    );
    assert_eq!(
        client.call("echo", Envelope::new().arg(1).kwarg("k", "v")).await?,
        json!({"args": [1], "kwargs": {"k": "v"}})
    );
    let quotient: f64 = client.call_as("divide", Envelope::new().arg(9).arg(3)).await?;
    assert_eq!(quotient, 3.0);

    client.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rabbitmq_timeout_and_publish() -> anyhow::Result<()> {
    let broker = testcontainers::RabbitContainer::start().await?;
    let server = start_server(&broker).await?;
    let client = connect_client(&broker).await?;

    let result = client
        .call_with(
            "missing",
            Envelope::new(),
            CallOptions::new().with_timeout(Duration::from_millis(300)),
        )
        .await;
    assert!(matches!(result, Err(AmrpcError::Timeout(300))));

    client.publish("ping", Envelope::new()).await?;
    assert_eq!(client.call("ping", Envelope::new()).await?, json!("pong"));

    client.close().await;
    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rabbitmq_concurrent_calls() -> anyhow::Result<()> {
    let broker = testcontainers::RabbitContainer::start().await?;
    let server = start_server(&broker).await?;
    let client = connect_client(&broker).await?;

    let (slow, fast) = tokio::join!(
        client.call("sleep", Envelope::new().arg(400)),
        client.call("sleep", Envelope::new().arg(50)),
    );
    assert_eq!(slow?, Value::from(400));
    assert_eq!(fast?, Value::from(50));

    client.close().await;
    server.stop().await?;
    Ok(())
}
