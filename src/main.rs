//! Quiz Gateway
//!
//! HTTP front end for the multiplayer math-quiz services. Every request is
//! turned into an RPC over a durable broker queue and answered from the
//! worker's correlated reply.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──HTTP──▶ gateway ──▶ RpcTransport ──publish──▶ auth_queue / game_queue / players_queue
//!                        ▲             │   ▲                              │
//!                        │      CircuitBreaker                          worker
//!                        │             │   │                              │
//!     Client ◀──HTTP─────┘             ▼   └──── private reply queue ◀────┘
//!                               ConnectionManager (one per process)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use quiz_gateway::broker::amqp::AmqpConnector;
use quiz_gateway::broker::memory::MemoryBroker;
use quiz_gateway::broker::Connector;
use quiz_gateway::config::{load_config, load_default};
use quiz_gateway::lifecycle::{forward_signals, Shutdown};
use quiz_gateway::observability::{logging, metrics};
use quiz_gateway::{ConnectionManager, GatewayServer, RpcTransport};

#[derive(Parser)]
#[command(name = "quiz-gateway", version)]
#[command(about = "HTTP gateway for the quiz services", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "QUIZ_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Use the in-process broker instead of AMQP (development only)
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_default()?,
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!("quiz-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.gateway.bind_address,
        queues = config.broker.queues.len(),
        rpc_timeout_ms = config.rpc.timeout_ms,
        failure_threshold = config.circuit_breaker.failure_threshold,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let connector: Arc<dyn Connector> = if args.in_memory {
        tracing::warn!("Using in-process broker; no external workers will be reachable");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpConnector::new(config.broker.url.clone()))
    };

    let connection = Arc::new(ConnectionManager::new(
        connector,
        &config.broker,
        config.circuit_breaker.clone(),
    ));

    if let Err(e) = connection.connect_with_backoff().await {
        tracing::error!(error = %e, "Failed to connect to broker");
        return Err(e.into());
    }
    if let Err(e) = connection.setup_queues().await {
        tracing::error!(error = %e, "Failed to declare broker queues");
        connection.close().await;
        return Err(e.into());
    }

    let transport = Arc::new(RpcTransport::new(connection.clone(), &config.rpc));

    let shutdown = Shutdown::new();
    forward_signals(shutdown.clone());

    let listener = TcpListener::bind(&config.gateway.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = GatewayServer::new(&config.gateway, transport.clone());
    let served = server.run(listener, shutdown.wait()).await;

    let cancelled = transport.tracker().cancel_all();
    if cancelled > 0 {
        tracing::info!(cancelled, "Cancelled pending RPC calls");
    }
    connection.close().await;

    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}
