//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging/metrics → Connect broker (with backoff)
//!     → Declare queues → Serve HTTP
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Cancel pending RPC calls
//!     → Close channel → Close connection → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Startup connect and queue declaration failures are the only fatal errors
//! - Teardown errors are logged, never returned

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{forward_signals, shutdown_signal};
