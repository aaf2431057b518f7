//! Correlation tracker: turns "send now, response later" into an awaitable.
//!
//! Flow:
//! 1. Router calls `register()` and gets the `PendingCall` for that ID
//! 2. Router writes the request to the transport
//! 3. Read loop receives the response and calls `complete()` / `fail()`
//! 4. Caller awaits the `PendingCall`, or gives up and it cancels itself
//!
//! The sender half of each entry lives only in the map, so whichever of
//! `complete`/`fail`/`cancel` removes the entry is the one resolution the
//! waiter ever sees.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::transport::protocol::{ErrorObject, RequestId, Response};

/// Why an entry was removed without a peer response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Shutdown,
    ConnectionLost(String),
    SendFailed(String),
    /// The waiting caller dropped its handle.
    Abandoned,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Shutdown => f.write_str("shutting down"),
            Self::ConnectionLost(why) => write!(f, "connection lost: {why}"),
            Self::SendFailed(why) => write!(f, "send failed: {why}"),
            Self::Abandoned => f.write_str("abandoned by caller"),
        }
    }
}

/// The single outcome delivered to a waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Result(Value),
    Error(ErrorObject),
    Cancelled(CancelReason),
}

struct PendingEntry {
    sender: oneshot::Sender<Resolution>,
    method: String,
    created_at: Instant,
    deadline: Option<Instant>,
}

/// Counters since creation.
#[derive(Debug, Default)]
pub struct TrackerStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub timed_out: AtomicU64,
}

/// Outstanding requests for one connection, keyed by wire ID.
pub struct Tracker {
    connection: String,
    pending: DashMap<RequestId, PendingEntry>,
    stats: TrackerStats,
}

impl Tracker {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            pending: DashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Register `id` and hand back the one handle its outcome is delivered to.
    ///
    /// Must happen before the request is written, so a fast response always
    /// finds its entry. Fails if `id` is already outstanding.
    pub fn register(
        self: &Arc<Self>,
        id: RequestId,
        method: &str,
        deadline: Option<Duration>,
    ) -> Result<PendingCall, RequestId> {
        let (sender, receiver) = oneshot::channel();
        let now = Instant::now();

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(id),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    sender,
                    method: method.to_string(),
                    created_at: now,
                    deadline: deadline.map(|d| now + d),
                });
            }
        }
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %self.connection, id = %id, method, "Registered pending request");

        Ok(PendingCall {
            tracker: Arc::clone(self),
            id,
            method: method.to_string(),
            caller_id: None,
            receiver: Some(receiver),
        })
    }

    /// Deliver a successful result. Unknown IDs are a soft warning.
    pub fn complete(&self, id: &RequestId, result: Value) -> bool {
        self.resolve(id, Resolution::Result(result), &self.stats.completed)
    }

    /// Deliver a peer error. Unknown IDs are a soft warning.
    pub fn fail(&self, id: &RequestId, error: ErrorObject) -> bool {
        self.resolve(id, Resolution::Error(error), &self.stats.failed)
    }

    /// Remove `id` and tell its waiter why.
    pub fn cancel(&self, id: &RequestId, reason: CancelReason) -> bool {
        let counter = if reason == CancelReason::Timeout {
            &self.stats.timed_out
        } else {
            &self.stats.cancelled
        };
        self.resolve(id, Resolution::Cancelled(reason), counter)
    }

    /// Cancel every outstanding entry. Returns how many were removed.
    pub fn cancel_all(&self, reason: &CancelReason) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.cancel(id, reason.clone()))
            .count()
    }

    /// Cancel entries whose deadline has passed. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| {
                let removed = self.cancel(id, CancelReason::Timeout);
                if removed {
                    warn!(connection = %self.connection, id = %id, "Removed expired pending request");
                }
                removed
            })
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    pub const fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    fn resolve(&self, id: &RequestId, resolution: Resolution, counter: &AtomicU64) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            if !matches!(resolution, Resolution::Cancelled(CancelReason::Abandoned)) {
                warn!(
                    connection = %self.connection,
                    id = %id,
                    "Resolution for unknown or expired correlation ID"
                );
            }
            return false;
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            connection = %self.connection,
            id = %id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis(),
            "Resolved pending request"
        );
        // A dropped receiver means the caller already left; nothing to do.
        let _ = entry.sender.send(resolution);
        true
    }
}

/// Consumer handle for one outstanding request.
///
/// Dropping it before it resolves cancels the tracker entry.
pub struct PendingCall {
    tracker: Arc<Tracker>,
    id: RequestId,
    method: String,
    caller_id: Option<RequestId>,
    receiver: Option<oneshot::Receiver<Resolution>>,
}

impl PendingCall {
    /// Wire ID the request was registered under.
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Report responses under `id` instead of the wire ID.
    #[must_use]
    pub fn with_caller_id(mut self, id: RequestId) -> Self {
        self.caller_id = Some(id);
        self
    }

    /// Wait for the raw resolution with no deadline.
    pub async fn resolution(mut self) -> Resolution {
        let Some(receiver) = self.receiver.as_mut() else {
            return Resolution::Cancelled(CancelReason::Abandoned);
        };
        let resolution = receiver
            .await
            .unwrap_or(Resolution::Cancelled(CancelReason::Abandoned));
        self.receiver = None;
        resolution
    }

    /// Wait up to `timeout` and map the outcome to a response or `CallError`.
    ///
    /// On expiry the entry is cancelled, so a late response is dropped.
    pub async fn wait(mut self, timeout: Duration) -> Result<Response, CallError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(self.closed(&CancelReason::Abandoned));
        };
        let outcome = tokio::time::timeout(timeout, receiver).await;
        self.receiver = None;

        let Ok(received) = outcome else {
            self.tracker.cancel(&self.id, CancelReason::Timeout);
            return Err(CallError::Timeout {
                method: self.method.clone(),
                timeout,
            });
        };
        let resolution = received.unwrap_or(Resolution::Cancelled(CancelReason::Abandoned));

        let id = self.caller_id.clone().unwrap_or_else(|| self.id.clone());
        match resolution {
            Resolution::Result(value) => Ok(Response::success(id, value)),
            Resolution::Error(error) => Err(CallError::Remote(error)),
            Resolution::Cancelled(CancelReason::Timeout) => Err(CallError::Timeout {
                method: self.method.clone(),
                timeout,
            }),
            Resolution::Cancelled(reason) => Err(self.closed(&reason)),
        }
    }

    fn closed(&self, reason: &CancelReason) -> CallError {
        CallError::Closed {
            connection: self.tracker.connection.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.tracker.cancel(&self.id, CancelReason::Abandoned);
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("connection", &self.tracker.connection)
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}
