//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! resilience, rpc, gateway produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Correlation ids are logged as fields, never in message text
//! - The request id set by the HTTP layer is propagated in responses

pub mod logging;
pub mod metrics;
