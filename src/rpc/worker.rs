//! Worker side of the RPC pattern.
//!
//! # Responsibilities
//! - Consume a durable work queue
//! - Dispatch `{method, params}` to the registered handler
//! - Publish the response to `reply_to` with the request's correlation id, then ack
//!
//! # Delivery Policy
//! ```text
//! unparseable request          → nack, no requeue (dropped)
//! missing reply_to/correlation → ack, dropped with a warning
//! unknown method               → UNKNOWN_METHOD (400) reply listing known methods
//! handler error                → RPC_ERROR (500) reply
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::connection::ConnectionManager;
use super::error::RpcResult;
use super::message::{RpcRequest, RpcResponse};
use crate::broker::{BrokerChannel, Delivery, MessageProperties};

/// Failure raised by a handler; reported to the caller as `RPC_ERROR`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid params: {err}"))
    }
}

pub type HandlerResult = Result<RpcResponse, HandlerError>;

/// Handles one RPC method.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, params: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, params: Value) -> HandlerResult {
        (self)(params).await
    }
}

/// Method name → handler table.
#[derive(Default, Clone)]
pub struct MethodRouter {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: impl Into<String>, handler: impl RpcHandler + 'static) -> Self {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let Some(handler) = self.handlers.get(&request.method) else {
            return RpcResponse::error(
                format!("Unknown method: {}", request.method),
                "UNKNOWN_METHOD",
                400,
            )
            .with_details(json!({ "availableMethods": self.methods() }));
        };

        match handler.handle(request.params).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(method = %request.method, error = %e, "RPC handler failed");
                RpcResponse::error(e.message, "RPC_ERROR", 500)
            }
        }
    }
}

/// Consumes one work queue and answers its requests.
pub struct RpcWorker {
    connection: Arc<ConnectionManager>,
    queue: String,
    router: MethodRouter,
}

impl RpcWorker {
    pub fn new(connection: Arc<ConnectionManager>, queue: impl Into<String>, router: MethodRouter) -> Self {
        Self {
            connection,
            queue: queue.into(),
            router,
        }
    }

    /// Serve requests until `shutdown` fires or the consumer ends.
    ///
    /// Requests are handled one at a time, in delivery order.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> RpcResult<()> {
        let channel = self.connection.channel()?;
        let mut subscription = channel.consume(&self.queue).await?;
        tracing::info!(queue = %self.queue, methods = ?self.router.methods(), "RPC worker consuming");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(queue = %self.queue, "RPC worker shutting down");
                    break;
                }
                item = subscription.deliveries.next() => match item {
                    Some(Ok(delivery)) => self.handle_delivery(&channel, delivery).await,
                    Some(Err(e)) => {
                        tracing::error!(queue = %self.queue, error = %e, "Work queue consumer failed");
                        return Err(e.into());
                    }
                    None => {
                        tracing::info!(queue = %self.queue, "Work queue consumer cancelled");
                        return Ok(());
                    }
                }
            }
        }

        if let Err(e) = channel.cancel(&subscription.consumer_tag).await {
            tracing::debug!(queue = %self.queue, error = %e, "Failed to cancel work consumer");
        }
        Ok(())
    }

    async fn handle_delivery(&self, channel: &Arc<dyn BrokerChannel>, delivery: Delivery) {
        let tag = delivery.delivery_tag;

        let request: RpcRequest = match serde_json::from_slice(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(queue = %self.queue, error = %e, "Dropping unparseable request");
                if let Err(e) = channel.nack(tag, false).await {
                    tracing::debug!(error = %e, "Failed to nack request");
                }
                return;
            }
        };

        let MessageProperties {
            reply_to: Some(reply_to),
            correlation_id: Some(correlation_id),
            ..
        } = delivery.properties
        else {
            tracing::warn!(
                queue = %self.queue,
                method = %request.method,
                "Dropping request without reply_to or correlation id"
            );
            if let Err(e) = channel.ack(tag).await {
                tracing::debug!(error = %e, "Failed to ack request");
            }
            return;
        };

        let method = request.method.clone();
        let response = self.router.dispatch(request).await;

        match serde_json::to_vec(&response) {
            Ok(body) => {
                let properties = MessageProperties {
                    correlation_id: Some(correlation_id.clone()),
                    ..MessageProperties::default()
                };
                // The caller may have timed out and dropped its reply queue.
                if let Err(e) = channel.publish(&reply_to, body, properties).await {
                    tracing::warn!(
                        queue = %self.queue,
                        method = %method,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to publish reply"
                    );
                }
            }
            Err(e) => {
                tracing::error!(method = %method, error = %e, "Failed to encode reply");
            }
        }

        if let Err(e) = channel.ack(tag).await {
            tracing::debug!(error = %e, "Failed to ack request");
        }
    }
}
