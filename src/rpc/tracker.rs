//! Correlation of in-flight RPC calls with their replies.
//!
//! # Responsibilities
//! - Hand out correlation ids that are unique among pending calls
//! - Bridge push-style reply delivery to a single-resolution future per call
//! - Guarantee every registered call is removed exactly once
//!
//! # Call State Machine
//! ```text
//! Pending → Resolved(outcome)   reply delivered (or malformed reply)
//! Pending → TimedOut            deadline passed
//! Pending → Cancelled           caller gave up / shutdown
//! ```
//! The transition is the removal of the map entry, so the first one wins and
//! later attempts for the same id are ignored.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::error::{RpcError, RpcResult};
use super::message::RpcResponse;
use crate::observability::metrics;

/// Terminal state requested for a pending call.
#[derive(Debug)]
pub enum Settlement {
    Resolved(RpcResult<RpcResponse>),
    TimedOut,
    Cancelled,
}

struct Slot {
    queue: String,
    tx: oneshot::Sender<RpcResult<RpcResponse>>,
}

/// Map from correlation id to pending call.
#[derive(Default)]
pub struct CorrelatedRequestTracker {
    pending: DashMap<String, Slot>,
}

impl CorrelatedRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call destined for `queue`.
    pub fn register(self: &Arc<Self>, queue: &str) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut slot = Some(Slot {
            queue: queue.to_string(),
            tx,
        });

        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(vacant) = self.pending.entry(candidate.clone()) {
                if let Some(slot) = slot.take() {
                    vacant.insert(slot);
                }
                break candidate;
            }
        };
        metrics::set_pending_calls(self.pending.len());

        PendingCall {
            id,
            rx,
            tracker: Arc::clone(self),
        }
    }

    /// Move a pending call to its terminal state.
    ///
    /// Returns false when the call already left `Pending` (or never existed).
    pub fn settle(&self, correlation_id: &str, settlement: Settlement) -> bool {
        let Some((_, slot)) = self.pending.remove(correlation_id) else {
            return false;
        };
        metrics::set_pending_calls(self.pending.len());

        match settlement {
            Settlement::Resolved(outcome) => {
                // The caller may have been dropped already; nothing left to notify.
                let _ = slot.tx.send(outcome);
            }
            Settlement::Cancelled => {
                let _ = slot.tx.send(Err(RpcError::Cancelled));
            }
            Settlement::TimedOut => {
                tracing::debug!(
                    correlation_id,
                    queue = %slot.queue,
                    "Pending call timed out"
                );
            }
        }
        true
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every pending call. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.settle(id, Settlement::Cancelled))
            .count()
    }

    fn forget(&self, correlation_id: &str) {
        if self.pending.remove(correlation_id).is_some() {
            metrics::set_pending_calls(self.pending.len());
        }
    }
}

/// Caller-side handle for one registered call.
///
/// Dropping it removes the call from the tracker if it is still pending.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<RpcResult<RpcResponse>>,
    tracker: Arc<CorrelatedRequestTracker>,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the call to be resolved or cancelled.
    pub async fn outcome(&mut self) -> RpcResult<RpcResponse> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Cancelled),
        }
    }

    /// Outcome already delivered, if any.
    pub fn try_outcome(&mut self) -> Option<RpcResult<RpcResponse>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.tracker.forget(&self.id);
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}
