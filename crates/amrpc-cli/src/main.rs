//! # AMRPC CLI Entry Point
//!
//! Main binary for amrpc. Runs a demo server, makes RPC calls and publishes
//! fire-and-forget messages against an AMQP broker.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo endpoints under am.math.*
//! amrpc serve --service math --concurrent
//!
//! # Make an RPC call (outputs raw JSON)
//! amrpc call divide --service math --args '[10, 4]'
//!
//! # Fire and forget
//! amrpc publish echo --service math --kwargs '{"event": "hello"}'
//! ```
//!
//! ## Configuration
//!
//! Defaults come from `AMRPC_BROKER_HOST`, `AMRPC_BROKER_PORT`,
//! `AMRPC_BROKER_USER`, `AMRPC_BROKER_PASSWORD`, `AMRPC_BROKER_VHOST`,
//! `AMRPC_PREFIX`, `AMRPC_SERVICE` and `AMRPC_EXCHANGE`. Flags win over the
//! environment.

use amrpc_client::{CallOptions, Client, ClientConfig};
use amrpc_common::transport::{AmqpConnector, ExchangeKind};
use amrpc_common::{BrokerConfig, RetryConfig, ServiceConfig};
use amrpc_server::{DispatchMode, Server, ServerConfig};
use anyhow::Result;
use argh::FromArgs;
use std::time::Duration;
use tokio_util::sync::CancellationToken;


#[derive(FromArgs)]
/// AMRPC - RPC over a message broker
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: Run a server with the demo endpoints
/// - **Call**: Make a single RPC call (unix-friendly JSON output)
/// - **Publish**: Publish without waiting for a result
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Publish(PublishArgs),
}

/// Arguments for running a server.
///
/// # Example
///
/// ```bash
/// amrpc serve --host rabbit --service math --prefetch 10 --concurrent
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo endpoints (ping, echo, divide)
struct ServeArgs {
    /// broker host (env AMRPC_BROKER_HOST, default localhost)
    #[argh(option)]
    host: Option<String>,

    /// broker port (env AMRPC_BROKER_PORT, default 5672)
    #[argh(option)]
    port: Option<u16>,

    /// broker user (env AMRPC_BROKER_USER, default guest)
    #[argh(option)]
    user: Option<String>,

    /// broker password (env AMRPC_BROKER_PASSWORD, default guest)
    #[argh(option)]
    password: Option<String>,

    /// broker virtual host (env AMRPC_BROKER_VHOST, default /)
    #[argh(option)]
    vhost: Option<String>,

    /// name prefix (env AMRPC_PREFIX, default am)
    #[argh(option)]
    prefix: Option<String>,

    /// service name (env AMRPC_SERVICE)
    #[argh(option)]
    service: Option<String>,

    /// exchange kind, topic or fanout (env AMRPC_EXCHANGE, default topic)
    #[argh(option)]
    exchange: Option<String>,

    /// maximum unacknowledged messages in flight
    ///
    /// Bounds how many handlers run at once with --concurrent.
    #[argh(option, default = "5")]
    prefetch: u16,

    /// run each message on its own task
    #[argh(switch)]
    concurrent: bool,

    /// give up after this many consecutive failed connection attempts
    ///
    /// Retries forever when not set.
    #[argh(option, long = "max-reconnects")]
    max_reconnects: Option<u32>,

    /// initial reconnect delay in milliseconds
    #[argh(option, long = "reconnect-delay-ms", default = "1000")]
    reconnect_delay_ms: u64,
}

/// Arguments for making a single RPC call.
///
/// Outputs the raw JSON reply (no pretty-printing) to stdout. Errors are
/// reported to stderr with a non-zero exit code.
///
/// # Examples
///
/// ```bash
/// amrpc call ping
/// amrpc call divide --args '[1, 0]'
/// amrpc call echo --kwargs '{"a": 1}' | jq '.kwargs.a'
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an endpoint and print its reply
struct CallArgs {
    /// method key, appended to the service namespace
    #[argh(positional)]
    key: String,

    /// JSON array of positional arguments
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// JSON object of keyword arguments
    #[argh(option, short = 'k', long = "kwargs", default = "\"{}\".into()")]
    kwargs: String,

    /// how long to wait for the reply in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,

    /// broker host (env AMRPC_BROKER_HOST, default localhost)
    #[argh(option)]
    host: Option<String>,

    /// broker port (env AMRPC_BROKER_PORT, default 5672)
    #[argh(option)]
    port: Option<u16>,

    /// broker user (env AMRPC_BROKER_USER, default guest)
    #[argh(option)]
    user: Option<String>,

    /// broker password (env AMRPC_BROKER_PASSWORD, default guest)
    #[argh(option)]
    password: Option<String>,

    /// broker virtual host (env AMRPC_BROKER_VHOST, default /)
    #[argh(option)]
    vhost: Option<String>,

    /// name prefix (env AMRPC_PREFIX, default am)
    #[argh(option)]
    prefix: Option<String>,

    /// service name (env AMRPC_SERVICE)
    #[argh(option)]
    service: Option<String>,

    /// exchange kind, topic or fanout (env AMRPC_EXCHANGE, default topic)
    #[argh(option)]
    exchange: Option<String>,
}

/// Arguments for a fire-and-forget publish.
#[derive(FromArgs)]
#[argh(subcommand, name = "publish")]
/// publish to an endpoint without waiting for a reply
struct PublishArgs {
    /// method key, appended to the service namespace
    #[argh(positional)]
    key: String,

    /// JSON array of positional arguments
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// JSON object of keyword arguments
    #[argh(option, short = 'k', long = "kwargs", default = "\"{}\".into()")]
    kwargs: String,

    /// broker host (env AMRPC_BROKER_HOST, default localhost)
    #[argh(option)]
    host: Option<String>,

    /// broker port (env AMRPC_BROKER_PORT, default 5672)
    #[argh(option)]
    port: Option<u16>,

    /// broker user (env AMRPC_BROKER_USER, default guest)
    #[argh(option)]
    user: Option<String>,

    /// broker password (env AMRPC_BROKER_PASSWORD, default guest)
    #[argh(option)]
    password: Option<String>,

    /// broker virtual host (env AMRPC_BROKER_VHOST, default /)
    #[argh(option)]
    vhost: Option<String>,

    /// name prefix (env AMRPC_PREFIX, default am)
    #[argh(option)]
    prefix: Option<String>,

    /// service name (env AMRPC_SERVICE)
    #[argh(option)]
    service: Option<String>,

    /// exchange kind, topic or fanout (env AMRPC_EXCHANGE, default topic)
    #[argh(option)]
    exchange: Option<String>,
}

/// Connection flags shared by every subcommand.
struct ConnectionFlags<'a> {
    host: &'a Option<String>,
    port: Option<u16>,
    user: &'a Option<String>,
    password: &'a Option<String>,
    vhost: &'a Option<String>,
    prefix: &'a Option<String>,
    service: &'a Option<String>,
    exchange: &'a Option<String>,
}

macro_rules! connection_flags {
    ($args:expr) => {
        ConnectionFlags {
            host: &$args.host,
            port: $args.port,
            user: &$args.user,
            password: &$args.password,
            vhost: &$args.vhost,
            prefix: &$args.prefix,
            service: &$args.service,
            exchange: &$args.exchange,
        }
    };
}

impl ConnectionFlags<'_> {
    /// Environment first, then flags on top.
    fn resolve(&self) -> Result<(BrokerConfig, ServiceConfig)> {
        let mut broker = BrokerConfig::from_env()?;
        if let Some(host) = self.host {
            broker.host = host.clone();
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(user) = self.user {
            broker.user = user.clone();
        }
        if let Some(password) = self.password {
            broker.password = password.clone();
        }
        if let Some(vhost) = self.vhost {
            broker.vhost = vhost.clone();
        }

        let mut service = ServiceConfig::from_env()?;
        if let Some(prefix) = self.prefix {
            service.prefix = prefix.clone();
        }
        if let Some(name) = self.service {
            service.service = name.clone();
        }
        if let Some(exchange) = self.exchange {
            service.exchange_kind = exchange.parse::<ExchangeKind>()?;
        }
        service.validate()?;
        Ok((broker, service))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call/publish keep stdout clean for unix tool usage (piping to jq, etc.)
    if matches!(cli.command, Commands::Serve(_)) {
        // Set default log level to INFO, but allow RUST_LOG env var to override
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Publish(args) => run_publish(args).await,
    }
}

/// Executes the `serve` subcommand until Ctrl-C.
async fn run_serve(args: ServeArgs) -> Result<()> {
    let (broker, service) = connection_flags!(args).resolve()?;

    let retry = RetryConfig {
        max_attempts: args.max_reconnects,
        initial_backoff_ms: args.reconnect_delay_ms,
        ..RetryConfig::default()
    };

    let config = ServerConfig::new(service)
        .with_broker(broker)
        .with_prefetch(args.prefetch)
        .with_dispatch(if args.concurrent {
            DispatchMode::Concurrent
        } else {
            DispatchMode::Inline
        })
        .with_retry(retry);
    tracing::info!("Broker: {:?}", config.broker);

    let mut server = Server::new(config, AmqpConnector::new())?;
    amrpc_cli::demo::register_demo_endpoints(&mut server)?;
    for endpoint in server.registry().iter() {
        tracing::info!("Serving {}", endpoint.routing_key());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}

/// Executes the `call` subcommand.
///
/// No tracing/logging is initialized for this command to keep output clean
/// for unix tool usage (piping to jq, etc.).
///
/// # Errors
///
/// Returns an error if:
/// - The args or kwargs strings are not valid JSON of the right shape
/// - The connection to the broker fails
/// - No reply arrives within the timeout
async fn run_call(args: CallArgs) -> Result<()> {
    // Validate the arguments before touching the network
    let envelope = amrpc_cli::parse_envelope(&args.args, &args.kwargs)?;
    let (broker, service) = connection_flags!(args).resolve()?;

    let config = ClientConfig::new(service)
        .with_broker(broker)
        .with_timeout_ms(args.timeout_ms);
    let client = Client::connect(config, AmqpConnector::new()).await?;
    let result = client
        .call_with(
            &args.key,
            envelope,
            CallOptions::new().with_timeout(Duration::from_millis(args.timeout_ms)),
        )
        .await;
    client.close().await;

    // Output raw JSON to stdout
    println!("{}", serde_json::to_string(&result?)?);
    Ok(())
}

/// Executes the `publish` subcommand.
async fn run_publish(args: PublishArgs) -> Result<()> {
    let envelope = amrpc_cli::parse_envelope(&args.args, &args.kwargs)?;
    let (broker, service) = connection_flags!(args).resolve()?;

    let config = ClientConfig::new(service).with_broker(broker);
    let client = Client::connect(config, AmqpConnector::new()).await?;
    let result = client.publish(&args.key, envelope).await;
    client.close().await;
    result?;
    Ok(())
}
