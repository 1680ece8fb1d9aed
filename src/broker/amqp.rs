//! AMQP 0-9-1 broker backed by lapin.
//!
//! # Responsibilities
//! - Open the connection and a publisher-confirm channel
//! - Map broker primitives onto basic.* and queue.* methods
//! - Forward connection errors as `ConnectionEvent`s
//! - Report connection status for closes lapin does not raise as errors
//!
//! # Design Decisions
//! - Publishes are `mandatory` with confirms: an unroutable message comes back as a
//!   basic.return and a nack means the broker refused it
//! - Durable queues carry `x-message-ttl` and `x-max-length`
//! - lapin only calls `on_error` for a failed connection; a clean close from
//!   the broker shows up in `Connection::status`, which `is_open` reads

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent, Connector,
    Delivery, EventHandler, MessageProperties, Subscription,
};
use crate::config::schema::QueueConfig;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Connects to an AMQP broker at a fixed URI.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, on_event: EventHandler) -> BrokerResult<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        connection.on_error(move |err| {
            on_event(ConnectionEvent::Error(err.to_string()));
            on_event(ConnectionEvent::Closed);
        });

        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        let id = channel.id();
        channel.on_error(move |err| {
            tracing::error!(channel = id, error = %err, "AMQP channel error");
        });
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connection.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn queue_arguments(queue: &QueueConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongLongInt(i64::from(queue.message_ttl_ms)),
    );
    args.insert(
        ShortString::from("x-max-length"),
        AMQPValue::LongLongInt(i64::from(queue.max_length)),
    );
    args
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default().with_content_type(ShortString::from("application/json"));
    if let Some(id) = properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(id));
    }
    if let Some(reply_to) = properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to));
    }
    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT);
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }
    props
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        persistent: *props.delivery_mode() == Some(PERSISTENT),
        timestamp: *props.timestamp(),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await?;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> BrokerResult<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &payload,
                to_basic_properties(properties),
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable(queue.to_string())),
            Confirmation::Nack(_) => Err(BrokerError::Rejected(queue.to_string())),
        }
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Subscription> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag().as_str().to_string();

        let deliveries = consumer
            .map(|item| {
                item.map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    properties: from_basic_properties(&delivery.properties),
                    payload: delivery.data,
                })
                .map_err(BrokerError::from)
            })
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.channel.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_mapping() {
        let props = to_basic_properties(MessageProperties {
            correlation_id: Some("abc".to_string()),
            reply_to: Some("amq.gen-1".to_string()),
            persistent: true,
            timestamp: Some(1_700_000_000_000),
        });
        let back = from_basic_properties(&props);
        assert_eq!(back.correlation_id.as_deref(), Some("abc"));
        assert_eq!(back.reply_to.as_deref(), Some("amq.gen-1"));
        assert!(back.persistent);
        assert_eq!(back.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_queue_arguments() {
        let args = queue_arguments(&QueueConfig::named("auth_queue"));
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-max-length")),
            Some(&AMQPValue::LongLongInt(1_000))
        );
    }
}
