//! Quiz Gateway Library
//!
//! RPC over durable message queues, a circuit breaker around the broker
//! connection, and the HTTP gateway that fronts the quiz services.

// Core subsystems
pub mod broker;
pub mod config;
pub mod gateway;
pub mod rpc;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use gateway::GatewayServer;
pub use lifecycle::Shutdown;
pub use rpc::{ConnectionManager, RpcTransport};
