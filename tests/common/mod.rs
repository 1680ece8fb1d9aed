//! Shared fixtures for integration tests: in-memory broker wiring, real
//! workers, and scripted workers that reply by hand.

#![allow(dead_code)]

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use quiz_gateway::broker::memory::MemoryBroker;
use quiz_gateway::broker::{
    BrokerChannel, BrokerConnection, ConnectionEvent, Connector, Delivery, MessageProperties, Subscription,
};
use quiz_gateway::config::schema::{BrokerConfig, CircuitBreakerConfig, QueueConfig, RpcConfig};
use quiz_gateway::lifecycle::Shutdown;
use quiz_gateway::rpc::{
    HandlerError, MethodRouter, RpcRequest, RpcResponse, RpcResult, RpcWorker,
};
use quiz_gateway::{ConnectionManager, RpcTransport};

pub fn breaker_config(failure_threshold: u32, reset_timeout_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        reset_timeout_ms,
        ..CircuitBreakerConfig::default()
    }
}

/// Broker config with the default queue set plus any extra queue names.
pub fn broker_config(extra_queues: &[&str]) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config
        .queues
        .extend(extra_queues.iter().map(|name| QueueConfig::named(*name)));
    config
}

/// A connected manager with its queues declared.
pub async fn connected_manager(
    broker: &MemoryBroker,
    config: &BrokerConfig,
    breaker: CircuitBreakerConfig,
) -> Arc<ConnectionManager> {
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        config,
        breaker,
    ));
    manager.connect().await.unwrap();
    manager.setup_queues().await.unwrap();
    manager
}

pub async fn transport(
    broker: &MemoryBroker,
    extra_queues: &[&str],
    breaker: CircuitBreakerConfig,
    timeout_ms: u64,
) -> Arc<RpcTransport> {
    let manager = connected_manager(broker, &broker_config(extra_queues), breaker).await;
    Arc::new(RpcTransport::new(manager, &RpcConfig { timeout_ms }))
}

/// Handlers: `ping`, `echo` (returns params), `sleep` (waits `params.ms`).
pub fn echo_router() -> MethodRouter {
    MethodRouter::new()
        .route("ping", |_: Value| async move {
            Ok::<_, HandlerError>(RpcResponse::success(serde_json::json!({"pong": true}), "pong"))
        })
        .route("echo", |params: Value| async move {
            Ok::<_, HandlerError>(RpcResponse::success(params, "echo"))
        })
        .route("sleep", |params: Value| async move {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok::<_, HandlerError>(RpcResponse::success(params, "slept"))
        })
}

pub struct RunningWorker {
    pub shutdown: Shutdown,
    pub handle: JoinHandle<RpcResult<()>>,
}

impl RunningWorker {
    pub async fn stop(self) {
        self.shutdown.trigger();
        self.handle.await.unwrap().unwrap();
    }
}

/// Start an `RpcWorker` on its own connection and wait until it is consuming.
pub async fn spawn_worker(broker: &MemoryBroker, queue: &str, router: MethodRouter) -> RunningWorker {
    let manager = connected_manager(
        broker,
        &broker_config(&[queue]),
        CircuitBreakerConfig::default(),
    )
    .await;
    let consumers_before = broker.consumer_count(queue);

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let worker = RpcWorker::new(manager, queue, router);
    let handle = tokio::spawn(async move { worker.run(rx).await });

    while broker.consumer_count(queue) == consumers_before {
        tokio::task::yield_now().await;
    }
    RunningWorker { shutdown, handle }
}

/// Worker driven by the test: read requests, reply whenever and however.
pub struct ScriptedWorker {
    pub channel: Arc<dyn BrokerChannel>,
    subscription: Subscription,
    _connection: Box<dyn BrokerConnection>,
}

impl ScriptedWorker {
    pub async fn start(broker: &MemoryBroker, queue: &str) -> Self {
        let connection = broker
            .connect(Arc::new(|_: ConnectionEvent| {}))
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.declare_queue(&QueueConfig::named(queue)).await.unwrap();
        let subscription = channel.consume(queue).await.unwrap();
        Self {
            channel,
            subscription,
            _connection: connection,
        }
    }

    pub async fn next_request(&mut self) -> (Delivery, RpcRequest) {
        let delivery = self.subscription.deliveries.next().await.unwrap().unwrap();
        self.channel.ack(delivery.delivery_tag).await.unwrap();
        let request = serde_json::from_slice(&delivery.payload).unwrap();
        (delivery, request)
    }

    pub async fn reply_raw(&self, to: &Delivery, payload: Vec<u8>) {
        let reply_to = to.properties.reply_to.clone().unwrap();
        self.channel
            .publish(
                &reply_to,
                payload,
                MessageProperties {
                    correlation_id: to.properties.correlation_id.clone(),
                    ..MessageProperties::default()
                },
            )
            .await
            .unwrap();
    }

    pub async fn reply(&self, to: &Delivery, response: &RpcResponse) {
        self.reply_raw(to, serde_json::to_vec(response).unwrap()).await;
    }
}
