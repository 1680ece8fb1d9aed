//! RPC over durable message queues.
//!
//! # Data Flow
//! ```text
//! Caller (gateway handler)
//!     → transport.rs: RpcTransport::call / call_until
//!         → connection.rs: ConnectionManager (shared channel + circuit breaker)
//!         → tracker.rs: CorrelatedRequestTracker (correlation id → pending call)
//!     → durable work queue
//!     → worker.rs: RpcWorker → MethodRouter → RpcHandler
//!     → private reply queue → tracker settles the pending call
//! ```
//!
//! # Design Decisions
//! - Wire envelopes (message.rs) are plain serde types shared by both sides
//! - Transport failures are typed (error.rs); only the gateway maps them to HTTP

pub mod connection;
pub mod error;
pub mod message;
pub mod tracker;
pub mod transport;
pub mod worker;

pub use connection::{ConnectionHealth, ConnectionManager};
pub use error::{RpcError, RpcResult};
pub use message::{RpcErrorBody, RpcRequest, RpcResponse};
pub use tracker::{CorrelatedRequestTracker, PendingCall, Settlement};
pub use transport::RpcTransport;
pub use worker::{HandlerError, HandlerResult, MethodRouter, RpcHandler, RpcWorker};
