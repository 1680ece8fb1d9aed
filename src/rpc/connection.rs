//! Broker connection lifecycle.
//!
//! # Responsibilities
//! - Establish the connection and shared channel (through the circuit breaker)
//! - Observe connection-level errors and flip connectivity asynchronously
//! - Re-check the connection status on read, for closes that raise no event
//! - Declare the durable queue topology
//! - Ordered shutdown: channel first, then connection
//!
//! # Design Decisions
//! - One manager per process, passed by `Arc` to every component that needs the broker
//! - Connection and channel live together in a `Session` swapped atomically
//! - Events from a superseded connection never affect the current one

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::Mutex;

use super::error::{RpcError, RpcResult};
use crate::broker::{BrokerChannel, BrokerConnection, ConnectionEvent, Connector, EventHandler};
use crate::config::schema::{BrokerConfig, CircuitBreakerConfig, QueueConfig};
use crate::resilience::{Backoff, CircuitBreaker, CircuitSnapshot, CircuitState};

struct Session {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Snapshot exposed on health endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    #[serde(flatten)]
    pub breaker: CircuitSnapshot,
    pub is_connected: bool,
    pub has_channel: bool,
}

/// Owns the broker connection, its channel, and the circuit breaker around both.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    queues: Vec<QueueConfig>,
    backoff: Backoff,
    connect_attempts: u32,
    breaker: Arc<CircuitBreaker>,
    session: ArcSwapOption<Session>,
    connected: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    lifecycle: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        broker: &BrokerConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            connector,
            queues: broker.queues.clone(),
            backoff: Backoff::new(broker.connect_backoff_base_ms, broker.connect_backoff_max_ms),
            connect_attempts: broker.connect_attempts.max(1),
            breaker: Arc::new(CircuitBreaker::new(breaker)),
            session: ArcSwapOption::empty(),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let open = self
            .session
            .load()
            .as_ref()
            .is_some_and(|session| session.connection.is_open());
        if !open && self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Broker connection no longer open");
        }
        open
    }

    /// Active channel, or `NotConnected`.
    ///
    /// Connectivity can drop at any moment; callers re-check on every use.
    pub fn channel(&self) -> RpcResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }
        self.session
            .load()
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or(RpcError::NotConnected)
    }

    fn event_handler(&self, generation: u64) -> EventHandler {
        let connected = self.connected.clone();
        let current = self.generation.clone();
        Arc::new(move |event: ConnectionEvent| {
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            match event {
                ConnectionEvent::Error(error) => {
                    tracing::error!(error = %error, "Broker connection error");
                }
                ConnectionEvent::Closed => {
                    tracing::info!("Broker connection closed");
                }
            }
            connected.store(false, Ordering::SeqCst);
        })
    }

    /// Connect and open the shared channel, replacing any previous session.
    pub async fn connect(&self) -> RpcResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(previous) = self.session.swap(None) {
            self.connected.store(false, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            shutdown_session(&previous).await;
        }

        self.breaker
            .execute(|| async {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!("Connecting to broker");

                let connection = self
                    .connector
                    .connect(self.event_handler(generation))
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Broker connection failed");
                        RpcError::Broker(e)
                    })?;

                let channel = match connection.open_channel().await {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to open broker channel");
                        if let Err(close_err) = connection.close().await {
                            tracing::debug!(error = %close_err, "Error closing half-open connection");
                        }
                        return Err(RpcError::Broker(e));
                    }
                };

                self.session.store(Some(Arc::new(Session {
                    connection,
                    channel,
                })));
                self.connected.store(true, Ordering::SeqCst);
                tracing::info!("Broker connected");
                Ok(())
            })
            .await
    }

    /// Connect, retrying with backoff up to the configured number of attempts.
    pub async fn connect_with_backoff(&self) -> RpcResult<()> {
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.connect_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.connect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Declare the durable queue set. Safe to repeat.
    pub async fn setup_queues(&self) -> RpcResult<()> {
        let channel = self.channel()?;
        for queue in &self.queues {
            channel.declare_queue(queue).await.map_err(|e| {
                tracing::error!(queue = %queue.name, error = %e, "Queue setup failed");
                RpcError::Broker(e)
            })?;
            tracing::debug!(
                queue = %queue.name,
                message_ttl_ms = queue.message_ttl_ms,
                max_length = queue.max_length,
                "Queue declared"
            );
        }
        tracing::info!(queues = self.queues.len(), "Broker queues setup completed");
        Ok(())
    }

    /// Close channel then connection. Teardown errors are logged, never returned.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.swap(None) {
            // Our own close is not a connection failure worth reporting.
            self.generation.fetch_add(1, Ordering::SeqCst);
            shutdown_session(&session).await;
            tracing::info!("Broker connection closed gracefully");
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        ConnectionHealth {
            breaker: self.breaker.snapshot(),
            is_connected: self.is_connected(),
            has_channel: self.session.load().is_some(),
        }
    }

    /// Connected, with a channel, and the circuit not open.
    pub fn is_healthy(&self) -> bool {
        self.is_connected()
            && self.session.load().is_some()
            && self.breaker.state() != CircuitState::Open
    }
}

async fn shutdown_session(session: &Session) {
    if let Err(e) = session.channel.close().await {
        tracing::warn!(error = %e, "Error closing broker channel");
    }
    if let Err(e) = session.connection.close().await {
        tracing::warn!(error = %e, "Error closing broker connection");
    }
}
