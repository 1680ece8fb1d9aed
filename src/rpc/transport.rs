//! Request/reply over durable queues.
//!
//! # Responsibilities
//! - Publish a request with a fresh correlation id and a private reply queue
//! - Race the reply against the deadline and an optional cancellation signal
//! - Tear down the reply consumer and queue on every exit path
//! - Account each call's outcome on the shared circuit breaker
//!
//! # Data Flow
//! ```text
//! call_until(queue, request, timeout, cancel)
//!     → channel check (NotConnected fails fast, outside the breaker)
//!     → CircuitBreaker::execute_with
//!         → tracker.register → declare reply queue → consume → spawn reply pump
//!         → publish {correlation_id, reply_to, persistent, timestamp}
//!         → select { reply | deadline | cancel } → tracker.settle
//!         → ReplyRoute::release (cancel consumer, delete queue)
//!     → metrics + log
//! ```
//!
//! # Design Decisions
//! - One exclusive, auto-deleting reply queue per call: the queue only ever
//!   carries that call's reply, so there is no cross-call filtering
//! - The deadline is fixed when the call starts and also bounds queue setup
//! - The reply-queue declare runs on its own task; a call that gives up while
//!   it is in flight deletes the queue once the declare lands
//! - A timeout is never retried here; retry policy belongs to the caller

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::connection::ConnectionManager;
use super::error::{RpcError, RpcResult};
use super::message::{RpcRequest, RpcResponse};
use super::tracker::{CorrelatedRequestTracker, PendingCall, Settlement};
use crate::broker::{BrokerChannel, BrokerError, BrokerResult, Delivery, MessageProperties};
use crate::config::schema::RpcConfig;
use crate::observability::metrics;

/// Client side of the RPC pattern. Cheap to share behind an `Arc`.
pub struct RpcTransport {
    connection: Arc<ConnectionManager>,
    tracker: Arc<CorrelatedRequestTracker>,
    default_timeout: Duration,
}

enum Race {
    Settled(RpcResult<RpcResponse>),
    TimedOut,
    Cancelled,
}

impl RpcTransport {
    pub fn new(connection: Arc<ConnectionManager>, config: &RpcConfig) -> Self {
        Self {
            connection,
            tracker: Arc::new(CorrelatedRequestTracker::new()),
            default_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn tracker(&self) -> &Arc<CorrelatedRequestTracker> {
        &self.tracker
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `request` to `queue` and wait for the correlated reply.
    ///
    /// `timeout` falls back to the configured default.
    pub async fn call(
        &self,
        queue: &str,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> RpcResult<RpcResponse> {
        self.call_until(queue, request, timeout, std::future::pending::<()>())
            .await
    }

    /// Like [`call`](Self::call), but gives up with `Cancelled` once `cancel` completes.
    pub async fn call_until<C>(
        &self,
        queue: &str,
        request: &RpcRequest,
        timeout: Option<Duration>,
        cancel: C,
    ) -> RpcResult<RpcResponse>
    where
        C: Future<Output = ()>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let result = self
            .dispatch(queue, request, timeout, started + timeout, cancel)
            .await;

        match &result {
            Ok(response) => {
                metrics::record_rpc_call(queue, "success", started);
                tracing::debug!(
                    queue,
                    method = %request.method,
                    success = response.success,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "RPC call completed"
                );
            }
            Err(e) => {
                metrics::record_rpc_call(queue, e.kind(), started);
                let breaker = self.connection.breaker().snapshot();
                tracing::warn!(
                    queue,
                    method = %request.method,
                    error = %e,
                    breaker_state = ?breaker.state,
                    breaker_failures = breaker.failure_count,
                    "RPC call failed"
                );
            }
        }
        result
    }

    async fn dispatch<C>(
        &self,
        queue: &str,
        request: &RpcRequest,
        timeout: Duration,
        deadline: Instant,
        cancel: C,
    ) -> RpcResult<RpcResponse>
    where
        C: Future<Output = ()>,
    {
        let payload = serde_json::to_vec(request).map_err(RpcError::Encode)?;
        let channel = self.connection.channel()?;

        self.connection
            .breaker()
            .execute_with(
                || self.round_trip(channel, queue, payload, timeout, deadline, cancel),
                RpcError::counts_as_failure,
            )
            .await
    }

    async fn round_trip<C>(
        &self,
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        payload: Vec<u8>,
        timeout: Duration,
        deadline: Instant,
        cancel: C,
    ) -> RpcResult<RpcResponse>
    where
        C: Future<Output = ()>,
    {
        let mut call = self.tracker.register(queue);
        let correlation_id = call.id().to_string();
        let mut route: Option<ReplyRoute> = None;

        let race = {
            let exchange = self.exchange(&channel, queue, payload, &mut call, &mut route);
            tokio::select! {
                result = exchange => Race::Settled(result),
                _ = tokio::time::sleep_until(deadline) => Race::TimedOut,
                _ = cancel => Race::Cancelled,
            }
        };

        let result = match race {
            Race::Settled(result) => result,
            Race::TimedOut => {
                if self.tracker.settle(&correlation_id, Settlement::TimedOut) {
                    Err(RpcError::Timeout {
                        queue: queue.to_string(),
                        timeout,
                    })
                } else {
                    // The reply landed between the timer firing and the settle.
                    call.try_outcome().unwrap_or(Err(RpcError::Timeout {
                        queue: queue.to_string(),
                        timeout,
                    }))
                }
            }
            Race::Cancelled => {
                self.tracker.settle(&correlation_id, Settlement::Cancelled);
                call.try_outcome().unwrap_or(Err(RpcError::Cancelled))
            }
        };

        if let Some(route) = route.take() {
            route.release().await;
        }
        result
    }

    /// Set up the reply path, publish, and wait for the settled outcome.
    async fn exchange(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        queue: &str,
        payload: Vec<u8>,
        call: &mut PendingCall,
        route: &mut Option<ReplyRoute>,
    ) -> RpcResult<RpcResponse> {
        let reply_queue = Declaring::start(channel).finish().await?;
        let route = route.insert(ReplyRoute::new(channel.clone(), reply_queue.clone()));

        let subscription = channel.consume(&reply_queue).await?;
        let pump = tokio::spawn(pump_replies(
            channel.clone(),
            self.tracker.clone(),
            subscription.deliveries,
        ));
        route.attach(subscription.consumer_tag, pump);

        let properties = MessageProperties {
            correlation_id: Some(call.id().to_string()),
            reply_to: Some(reply_queue),
            persistent: true,
            timestamp: Some(epoch_millis()),
        };
        channel
            .publish(queue, payload, properties)
            .await
            .map_err(|source| RpcError::PublishFailed {
                queue: queue.to_string(),
                source,
            })?;
        tracing::trace!(queue, correlation_id = call.id(), "RPC request published");

        call.outcome().await
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Feed reply deliveries into the tracker until the consumer ends.
///
/// A bad message settles (or is discarded) on its own; it never stops the loop.
async fn pump_replies(
    channel: Arc<dyn BrokerChannel>,
    tracker: Arc<CorrelatedRequestTracker>,
    mut deliveries: BoxStream<'static, BrokerResult<Delivery>>,
) {
    while let Some(item) = deliveries.next().await {
        let delivery = match item {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!(error = %e, "Reply consumer failed");
                break;
            }
        };

        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            tracing::warn!(
                delivery_tag = delivery.delivery_tag,
                "Discarding reply without correlation id"
            );
            settle_delivery(&channel, delivery.delivery_tag, false).await;
            continue;
        };

        let outcome = serde_json::from_slice::<RpcResponse>(&delivery.payload)
            .map_err(RpcError::InvalidResponseFormat);
        if let Err(e) = &outcome {
            tracing::warn!(correlation_id, error = %e, "Malformed RPC reply");
        }

        let matched = tracker.settle(correlation_id, Settlement::Resolved(outcome));
        if !matched {
            tracing::debug!(correlation_id, "Discarding reply for unknown or settled call");
        }
        settle_delivery(&channel, delivery.delivery_tag, matched).await;
    }
}

async fn settle_delivery(channel: &Arc<dyn BrokerChannel>, delivery_tag: u64, ack: bool) {
    let result = if ack {
        channel.ack(delivery_tag).await
    } else {
        channel.nack(delivery_tag, false).await
    };
    if let Err(e) = result {
        tracing::debug!(delivery_tag, error = %e, "Failed to settle reply delivery");
    }
}

/// Reply-queue declaration running on its own task.
///
/// Dropped before `finish` completes, it deletes the queue once the broker
/// has created it.
struct Declaring {
    channel: Arc<dyn BrokerChannel>,
    task: Option<JoinHandle<BrokerResult<String>>>,
}

impl Declaring {
    fn start(channel: &Arc<dyn BrokerChannel>) -> Self {
        let declaring = channel.clone();
        let task = tokio::spawn(async move { declaring.declare_reply_queue().await });
        Self {
            channel: channel.clone(),
            task: Some(task),
        }
    }

    async fn finish(mut self) -> RpcResult<String> {
        let Some(task) = self.task.as_mut() else {
            return Err(RpcError::Cancelled);
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(declared) => Ok(declared?),
            Err(e) => Err(BrokerError::Task(e.to_string()).into()),
        }
    }
}

impl Drop for Declaring {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let Ok(Ok(queue)) = task.await else {
                        return;
                    };
                    if let Err(e) = channel.delete_queue(&queue).await {
                        tracing::debug!(queue = %queue, error = %e, "Failed to delete orphaned reply queue");
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

/// Private reply queue plus its consumer and the task pumping its deliveries.
///
/// `release` tears it down in order; dropping it unreleased (the caller's future
/// was dropped mid-call) spawns the same teardown.
struct ReplyRoute {
    parts: Option<RouteParts>,
}

struct RouteParts {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    consumer_tag: Option<String>,
    pump: Option<JoinHandle<()>>,
}

impl ReplyRoute {
    fn new(channel: Arc<dyn BrokerChannel>, queue: String) -> Self {
        Self {
            parts: Some(RouteParts {
                channel,
                queue,
                consumer_tag: None,
                pump: None,
            }),
        }
    }

    fn attach(&mut self, consumer_tag: String, pump: JoinHandle<()>) {
        if let Some(parts) = self.parts.as_mut() {
            parts.consumer_tag = Some(consumer_tag);
            parts.pump = Some(pump);
        }
    }

    async fn release(mut self) {
        if let Some(parts) = self.parts.take() {
            parts.teardown().await;
        }
    }
}

impl RouteParts {
    async fn teardown(self) {
        // Cancelling the consumer ends the delivery stream, and with it the pump.
        let consumer_gone = match &self.consumer_tag {
            Some(tag) => match self.channel.cancel(tag).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(consumer_tag = %tag, error = %e, "Failed to cancel reply consumer");
                    false
                }
            },
            None => true,
        };
        if !consumer_gone {
            if let Some(pump) = &self.pump {
                pump.abort();
            }
        }
        // Auto-delete usually removes the queue with its last consumer; delete
        // explicitly for the paths where no consumer was ever attached.
        if let Err(e) = self.channel.delete_queue(&self.queue).await {
            tracing::debug!(queue = %self.queue, error = %e, "Failed to delete reply queue");
        }
    }
}

impl Drop for ReplyRoute {
    fn drop(&mut self) {
        if let Some(parts) = self.parts.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(parts.teardown());
                }
                Err(_) => {
                    if let Some(pump) = parts.pump {
                        pump.abort();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{ConnectionEvent, Connector};
    use crate::config::schema::{BrokerConfig, CircuitBreakerConfig};
    use serde_json::json;

    async fn transport(broker: &MemoryBroker) -> RpcTransport {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            &BrokerConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        manager.connect().await.unwrap();
        manager.setup_queues().await.unwrap();
        RpcTransport::new(manager, &RpcConfig { timeout_ms: 200 })
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker).await;

        let started = Instant::now();
        let err = transport
            .call("auth_queue", &RpcRequest::new("ping", json!({})), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(broker.reply_queue_count(), 0);
        assert_eq!(transport.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_published_with_reply_metadata() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker).await;

        let worker_broker = broker.clone();
        let worker = tokio::spawn(async move {
            let conn = worker_broker
                .connect(Arc::new(|_: ConnectionEvent| {}))
                .await
                .unwrap();
            let channel = conn.open_channel().await.unwrap();
            let mut sub = channel.consume("game_queue").await.unwrap();
            let delivery = sub.deliveries.next().await.unwrap().unwrap();
            channel.ack(delivery.delivery_tag).await.unwrap();

            let props = delivery.properties.clone();
            assert!(props.persistent);
            assert!(props.timestamp.is_some());
            let request: RpcRequest = serde_json::from_slice(&delivery.payload).unwrap();
            assert_eq!(request.method, "startGame");

            let reply = serde_json::to_vec(&RpcResponse::success(json!({"gameId": "g1"}), "ok"))
                .unwrap();
            channel
                .publish(
                    props.reply_to.as_deref().unwrap(),
                    reply,
                    MessageProperties {
                        correlation_id: props.correlation_id,
                        ..MessageProperties::default()
                    },
                )
                .await
                .unwrap();
        });

        let response = transport
            .call(
                "game_queue",
                &RpcRequest::new("startGame", json!({"difficulty": 1})),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        worker.await.unwrap();

        assert_eq!(response.data, Some(json!({"gameId": "g1"})));
        assert_eq!(broker.reply_queue_count(), 0);
    }
}
