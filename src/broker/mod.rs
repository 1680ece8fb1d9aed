//! Message broker seam.
//!
//! # Data Flow
//! ```text
//! ConnectionManager
//!     → Connector::connect (one connection per process)
//!     → BrokerConnection::open_channel (one shared channel)
//!     → BrokerChannel primitives used by rpc::transport and rpc::worker:
//!         declare_queue / declare_reply_queue / delete_queue
//!         publish / consume / cancel / ack / nack
//! ```
//!
//! # Implementations
//! - amqp.rs: AMQP 0-9-1 via lapin (production)
//! - memory.rs: in-process broker (tests, `--in-memory` development mode)
//!
//! # Design Decisions
//! - The RPC core only sees these primitives, never a broker client type
//! - Connection-level failures are reported through `ConnectionEvent`, not
//!   by failing in-flight operations

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::schema::QueueConfig;

/// Errors raised by broker primitives.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Could not establish the connection or channel.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection or channel is closed.
    #[error("channel closed")]
    Closed,

    /// No queue exists to route the message to.
    #[error("message to '{0}' is unroutable")]
    Unroutable(String),

    /// Broker refused the message (e.g. queue at capacity).
    #[error("broker rejected publish to '{0}'")]
    Rejected(String),

    /// Queue declared with arguments that conflict with an existing queue.
    #[error("queue '{0}' exists with different arguments")]
    QueueMismatch(String),

    /// Queue is exclusive to another connection or does not exist.
    #[error("queue '{0}' is not available")]
    QueueUnavailable(String),

    /// A broker operation running on its own task did not complete.
    #[error("broker task failed: {0}")]
    Task(String),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Metadata carried alongside a message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
    /// Send time in epoch milliseconds.
    pub timestamp: Option<u64>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// An active consumer: its tag and the stream of deliveries.
///
/// The stream ends once the consumer is cancelled.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: BoxStream<'static, BrokerResult<Delivery>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// Asynchronous connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    Closed,
}

/// Callback the connection invokes on `ConnectionEvent`s, from any task.
pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, on_event: EventHandler) -> BrokerResult<Box<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Whether the client still considers the connection open.
    fn is_open(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}

/// Channel-level broker primitives.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable, bounded work queue. Idempotent for matching arguments.
    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<()>;

    /// Declare a server-named, exclusive, auto-deleting queue and return its name.
    async fn declare_reply_queue(&self) -> BrokerResult<String>;

    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    /// Publish `payload` to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> BrokerResult<Subscription>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
