//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! RPC call / broker connect:
//!     → circuit_breaker.rs (admit, or fail fast while open)
//!     → operation runs with its own deadline (rpc::transport)
//!     → outcome recorded back into the breaker
//!
//! Startup connect:
//!     → backoff.rs (delay between connect attempts)
//! ```
//!
//! # Design Decisions
//! - Every broker interaction has a deadline
//! - The transport never retries a timed-out call; retry policy belongs to the caller
//! - Open circuit is the only backpressure signal callers receive

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::Backoff;
pub use circuit_breaker::{
    Admission, AdmissionGuard, CircuitBreaker, CircuitOpenError, CircuitSnapshot, CircuitState,
    RejectReason,
};
