//! RPC error taxonomy.

use std::time::Duration;

use crate::broker::BrokerError;
use crate::resilience::{CircuitOpenError, RejectReason};

/// Errors surfaced by the RPC transport and connection manager.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No active channel.
    #[error("broker not connected")]
    NotConnected,

    /// The broker refused or could not route the request.
    #[error("failed to publish to '{queue}': {source}")]
    PublishFailed {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// No reply arrived in time.
    #[error("RPC call to '{queue}' timed out after {}ms", .timeout.as_millis())]
    Timeout { queue: String, timeout: Duration },

    /// The request could not be serialized; nothing was sent.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The reply could not be parsed as a response envelope.
    #[error("invalid response format: {0}")]
    InvalidResponseFormat(#[source] serde_json::Error),

    /// Fast-fail from the circuit breaker; the operation never ran.
    #[error("circuit breaker is open")]
    CircuitOpen { reason: RejectReason },

    /// The caller gave up (shutdown or explicit cancellation).
    #[error("RPC call cancelled")]
    Cancelled,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl From<CircuitOpenError> for RpcError {
    fn from(err: CircuitOpenError) -> Self {
        RpcError::CircuitOpen { reason: err.reason }
    }
}

impl RpcError {
    /// Whether this outcome counts toward the breaker's failure threshold.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, RpcError::CircuitOpen { .. } | RpcError::Cancelled)
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::NotConnected => "not_connected",
            RpcError::PublishFailed { .. } => "publish_failed",
            RpcError::Timeout { .. } => "timeout",
            RpcError::Encode(_) => "encode",
            RpcError::InvalidResponseFormat(_) => "invalid_response",
            RpcError::CircuitOpen { .. } => "circuit_open",
            RpcError::Cancelled => "cancelled",
            RpcError::Broker(_) => "broker",
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
