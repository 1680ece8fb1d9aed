//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (RPC outcomes, latency, pending calls, breaker state)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `rpc_calls_total` (counter): RPC calls by queue, outcome
//! - `rpc_call_duration_seconds` (histogram): RPC latency by queue
//! - `rpc_pending_calls` (gauge): calls awaiting a reply
//! - `circuit_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `gateway_requests_total` (counter): HTTP requests by route, status
//!
//! # Design Decisions
//! - Recording without an installed recorder is a no-op, so library code and
//!   tests never need to initialize anything

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::Instant;

use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one finished RPC call.
pub fn record_rpc_call(queue: &str, outcome: &'static str, started: Instant) {
    metrics::counter!(
        "rpc_calls_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("rpc_call_duration_seconds", "queue" => queue.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn set_pending_calls(count: usize) {
    metrics::gauge!("rpc_pending_calls").set(count as f64);
}

pub fn record_circuit_state(state: CircuitState) {
    metrics::gauge!("circuit_breaker_state").set(state.as_gauge());
}

pub fn record_gateway_request(route: &'static str, status: u16) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
}
