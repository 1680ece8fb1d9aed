//! In-process broker.
//!
//! # Responsibilities
//! - Implement the broker primitives without a network hop
//! - Honour queue TTL and max-length (drop-head) bounds
//! - Give exclusive reply queues to their declaring connection and
//!   auto-delete them when their last consumer is cancelled
//! - Let tests inject faults: unreachable broker, rejected publishes,
//!   dropped connections, slow reply-queue declares
//!
//! # Design Decisions
//! - Round-robin delivery across consumers of one queue
//! - Unacked deliveries are tracked only so `nack(requeue)` can put them back;
//!   cancelling a consumer does not redeliver

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent, Connector,
    Delivery, EventHandler, MessageProperties, Subscription,
};
use crate::config::schema::QueueConfig;

const REPLY_QUEUE_PREFIX: &str = "amq.gen-";

struct Stored {
    enqueued: Instant,
    payload: Vec<u8>,
    properties: MessageProperties,
}

struct ConsumerSlot {
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    bounds: Option<QueueConfig>,
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    messages: VecDeque<Stored>,
    consumers: VecDeque<ConsumerSlot>,
}

impl Queue {
    fn is_expired(&self, stored: &Stored) -> bool {
        match &self.bounds {
            Some(bounds) => {
                stored.enqueued.elapsed() > Duration::from_millis(u64::from(bounds.message_ttl_ms))
            }
            None => false,
        }
    }
}

struct LiveConnection {
    id: u64,
    open: Arc<AtomicBool>,
    on_event: EventHandler,
}

#[derive(Default)]
struct BrokerState {
    queues: DashMap<String, Queue>,
    unacked: DashMap<u64, (String, Delivery)>,
    connections: Mutex<Vec<LiveConnection>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
    reject_publishes: AtomicBool,
    reply_declare_delay_ms: AtomicU64,
}

/// Shared handle to an in-process broker. Clones see the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, Vec<LiveConnection>> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make subsequent connect attempts fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make subsequent publishes fail as if every queue were at capacity.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.state.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Hold each reply-queue declare for `delay` after the queue is created,
    /// like a broker whose declare-ok is slow to arrive.
    pub fn set_reply_declare_delay(&self, delay: Duration) {
        self.state
            .reply_declare_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sever every open connection, emitting error and close events.
    pub fn drop_connections(&self) {
        let dropped: Vec<LiveConnection> = {
            let mut conns = self.connections();
            conns.drain(..).collect()
        };
        for conn in dropped {
            conn.open.store(false, Ordering::SeqCst);
            self.release_exclusive(conn.id);
            (conn.on_event)(ConnectionEvent::Error("connection reset by broker".to_string()));
            (conn.on_event)(ConnectionEvent::Closed);
        }
    }

    /// Close every open connection cleanly from the broker side, without
    /// emitting any event.
    pub fn close_connections_quietly(&self) {
        let closed: Vec<LiveConnection> = {
            let mut conns = self.connections();
            conns.drain(..).collect()
        };
        for conn in closed {
            conn.open.store(false, Ordering::SeqCst);
            self.release_exclusive(conn.id);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Messages waiting in `name` (not yet handed to a consumer).
    pub fn queue_len(&self, name: &str) -> usize {
        self.state
            .queues
            .get(name)
            .map(|q| q.messages.iter().filter(|m| !q.is_expired(m)).count())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queues
            .get(name)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Live server-named reply queues.
    pub fn reply_queue_count(&self) -> usize {
        self.state
            .queues
            .iter()
            .filter(|q| q.key().starts_with(REPLY_QUEUE_PREFIX))
            .count()
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn unacked_count(&self) -> usize {
        self.state.unacked.len()
    }

    fn release_exclusive(&self, conn_id: u64) {
        self.state
            .queues
            .retain(|_, q| q.exclusive_owner != Some(conn_id));
    }

    fn route(&self, queue: &str, stored: Stored) -> BrokerResult<()> {
        let mut q = self
            .state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Unroutable(queue.to_string()))?;

        while let Some(slot) = q.consumers.pop_front() {
            let delivery = Delivery {
                delivery_tag: self.next_id(),
                payload: stored.payload.clone(),
                properties: stored.properties.clone(),
            };
            self.state
                .unacked
                .insert(delivery.delivery_tag, (queue.to_string(), delivery.clone()));
            let tag = delivery.delivery_tag;
            if slot.tx.send(delivery).is_ok() {
                q.consumers.push_back(slot);
                return Ok(());
            }
            // Receiver went away without a cancel; forget the consumer.
            self.state.unacked.remove(&tag);
        }

        q.messages.push_back(stored);
        if let Some(max_length) = q.bounds.as_ref().map(|b| b.max_length as usize) {
            while q.messages.len() > max_length {
                q.messages.pop_front();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, on_event: EventHandler) -> BrokerResult<Box<dyn BrokerConnection>> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("broker unreachable".to_string()));
        }

        let id = self.next_id();
        let open = Arc::new(AtomicBool::new(true));
        let live = LiveConnection {
            id,
            open: open.clone(),
            on_event: on_event.clone(),
        };
        self.connections().push(live);

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
            open,
            on_event,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
    on_event: EventHandler,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            conn_id: self.id,
            conn_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.broker.connections().retain(|c| c.id != self.id);
        self.broker.release_exclusive(self.id);
        (self.on_event)(ConnectionEvent::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    conn_id: u64,
    conn_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) && self.conn_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<()> {
        self.ensure_open()?;
        let state = &self.broker.state;
        if let Some(existing) = state.queues.get(&queue.name) {
            return if existing.bounds.as_ref() == Some(queue) {
                Ok(())
            } else {
                Err(BrokerError::QueueMismatch(queue.name.clone()))
            };
        }
        state.queues.entry(queue.name.clone()).or_insert_with(|| Queue {
            bounds: Some(queue.clone()),
            exclusive_owner: None,
            auto_delete: false,
            messages: VecDeque::new(),
            consumers: VecDeque::new(),
        });
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        self.ensure_open()?;
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, uuid::Uuid::new_v4().simple());
        self.broker.state.queues.insert(
            name.clone(),
            Queue {
                bounds: None,
                exclusive_owner: Some(self.conn_id),
                auto_delete: true,
                messages: VecDeque::new(),
                consumers: VecDeque::new(),
            },
        );
        let delay = self.broker.state.reply_declare_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        // Deleting a missing queue is a no-op, as in AMQP.
        self.broker.state.queues.remove(name);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.broker.state.reject_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected(queue.to_string()));
        }
        self.broker.route(
            queue,
            Stored {
                enqueued: Instant::now(),
                payload,
                properties,
            },
        )
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Subscription> {
        self.ensure_open()?;
        let consumer_tag = format!("ctag-{}", self.broker.next_id());
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut q = self
                .broker
                .state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueUnavailable(queue.to_string()))?;
            if q.exclusive_owner.is_some_and(|owner| owner != self.conn_id) {
                return Err(BrokerError::QueueUnavailable(queue.to_string()));
            }

            let backlog: Vec<Stored> = q.messages.drain(..).collect();
            for stored in backlog {
                if q.is_expired(&stored) {
                    continue;
                }
                let delivery = Delivery {
                    delivery_tag: self.broker.next_id(),
                    payload: stored.payload,
                    properties: stored.properties,
                };
                self.broker
                    .state
                    .unacked
                    .insert(delivery.delivery_tag, (queue.to_string(), delivery.clone()));
                let _ = tx.send(delivery);
            }
            q.consumers.push_back(ConsumerSlot {
                tag: consumer_tag.clone(),
                tx,
            });
        }

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut emptied = None;
        for mut q in self.broker.state.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|slot| slot.tag != consumer_tag);
            if q.consumers.len() != before {
                if q.auto_delete && q.consumers.is_empty() {
                    emptied = Some(q.key().clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            self.broker.state.queues.remove(&name);
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.state.unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        if let Some((_, (queue, delivery))) = self.broker.state.unacked.remove(&delivery_tag) {
            if requeue {
                let _ = self.broker.route(
                    &queue,
                    Stored {
                        enqueued: Instant::now(),
                        payload: delivery.payload,
                        properties: delivery.properties,
                    },
                );
            }
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}
