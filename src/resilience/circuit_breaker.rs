//! Circuit breaker guarding calls into the message broker.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: downstream assumed down, calls fail fast
//! - Half-Open: probing whether the downstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: reset_timeout elapsed since the last failure
//! Half-Open → Closed: half_open_successes consecutive probe successes
//! Half-Open → Open: any probe failure (restarts the reset clock)
//! ```
//!
//! # Design Decisions
//! - One breaker per broker connection, shared by every in-flight call
//! - Admission is an explicit decision (`Admission`), not an error thrown from the gate
//! - Only one probe is in flight while Half-Open; concurrent callers are rejected
//! - Rejected calls never count as failures
//! - An admission dropped without a verdict releases the probe slot

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerConfig;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Why a call was turned away at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Open and still cooling down.
    Open { retry_after: Duration },
    /// Half-Open with a probe already in flight.
    ProbeInFlight,
}

/// Outcome of asking the breaker for permission to run an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected(RejectReason),
}

/// Raised in place of running the operation when the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError {
    pub reason: RejectReason,
}

/// Read-only view of the breaker for health endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_success_count: u32,
    /// Wall-clock time of the most recent failure, in epoch milliseconds.
    pub last_failure_timestamp: Option<u64>,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_period_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<SystemTime>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_success_count: 0,
                last_failure: None,
                last_failure_wall: None,
                probe_in_flight: false,
            }),
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the counters half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether an operation may run now.
    ///
    /// An `Allowed` admission must be followed by exactly one of
    /// [`record_success`](Self::record_success), [`record_failure`](Self::record_failure)
    /// or [`record_abandoned`](Self::record_abandoned). Prefer [`admit`](Self::admit),
    /// which cannot forget the last one.
    pub fn try_acquire(&self) -> Admission {
        match self.acquire() {
            Ok(_) => Admission::Allowed,
            Err(reason) => Admission::Rejected(reason),
        }
    }

    /// Admit an operation, returning a guard that must be given a verdict.
    ///
    /// Dropping the guard without one releases the half-open probe slot.
    pub fn admit(&self) -> Result<AdmissionGuard<'_>, CircuitOpenError> {
        match self.acquire() {
            Ok(probe) => Ok(AdmissionGuard {
                breaker: self,
                probe,
                settled: false,
            }),
            Err(reason) => Err(CircuitOpenError { reason }),
        }
    }

    /// `Ok(true)` when the admitted operation is the half-open probe.
    fn acquire(&self) -> Result<bool, RejectReason> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                let reset_timeout = self.reset_timeout();
                if elapsed >= reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_success_count = 0;
                    inner.probe_in_flight = true;
                    metrics::record_circuit_state(CircuitState::HalfOpen);
                    tracing::info!("Circuit breaker half-open, probing downstream");
                    Ok(true)
                } else {
                    Err(RejectReason::Open {
                        retry_after: reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(RejectReason::ProbeInFlight)
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Account for an admitted operation that succeeded.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            inner.half_open_success_count += 1;
            if inner.half_open_success_count >= self.config.half_open_successes {
                inner.state = CircuitState::Closed;
                inner.half_open_success_count = 0;
                metrics::record_circuit_state(CircuitState::Closed);
                tracing::info!("Circuit breaker closed, downstream recovered");
            }
        }
    }

    /// Account for an admitted operation that failed.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_wall = Some(SystemTime::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_success_count = 0;
                // Keep the invariant Open ⇒ failure_count >= threshold.
                inner.failure_count = inner.failure_count.max(self.config.failure_threshold);
                inner.state = CircuitState::Open;
                metrics::record_circuit_state(CircuitState::Open);
                tracing::warn!("Circuit breaker probe failed, reopening");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                metrics::record_circuit_state(CircuitState::Open);
                tracing::warn!(
                    failures = inner.failure_count,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Release an admission whose operation ended without a verdict (e.g. cancelled).
    pub fn record_abandoned(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Errors for which `is_failure` returns false (e.g. cancellation) release
    /// the admission without being counted.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let admission = self.admit()?;

        match operation().await {
            Ok(value) => {
                admission.succeeded();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    admission.failed();
                } else {
                    admission.abandon();
                }
                Err(err)
            }
        }
    }

    /// Run `operation` through the breaker, counting every error as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.execute_with(operation, |_| true).await
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_success_count: inner.half_open_success_count,
            last_failure_timestamp: inner.last_failure_wall.and_then(|at| {
                at.duration_since(UNIX_EPOCH)
                    .ok()
                    .map(|d| d.as_millis() as u64)
            }),
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout_ms,
            monitoring_period_ms: self.config.monitoring_period_ms,
        }
    }
}

/// A running operation's hold on the breaker.
///
/// Dropped without a verdict (the operation's future was dropped mid-flight),
/// it counts as abandoned.
#[must_use]
#[derive(Debug)]
pub struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl AdmissionGuard<'_> {
    /// Whether this admission is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    pub fn abandon(mut self) {
        self.settled = true;
        self.release();
    }

    fn release(&self) {
        // Only the probe holds the half-open slot.
        if self.probe {
            self.breaker.record_abandoned();
        }
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(probe = self.probe, "Circuit breaker admission dropped without a verdict");
            self.release();
        }
    }
}
