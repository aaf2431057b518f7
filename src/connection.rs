//! One logical peer session and its handshake state machine.
//!
//! ```text
//! New ──start_handshake──▶ Initializing ──complete_handshake──▶ Ready
//!                               │
//!                               └──timeout / fail_handshake──▶ Failed
//! any ──close──▶ Closed (terminal, idempotent)
//! ```
//!
//! All transitions go through the connection's own methods and are
//! serialized by its state lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{StateError, TransportError};
use crate::tracker::{CancelReason, Tracker};
use crate::transport::protocol::RequestId;
use crate::transport::Transport;

/// Handshake progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Initializing,
    Ready,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the server reported during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Negotiated {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: Option<Value>,
}

/// Consistent point-in-time view of the lifecycle.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub negotiated: Option<Negotiated>,
    pub handshake_started: Option<Instant>,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    negotiated: Option<Negotiated>,
    handshake_started: Option<Instant>,
    failure: Option<String>,
    timer: Option<AbortHandle>,
}

/// A named peer session bound to one transport.
pub struct Connection {
    id: String,
    name: String,
    transport: Arc<dyn Transport>,
    tracker: Arc<Tracker>,
    lifecycle: RwLock<Lifecycle>,
    created_at: SystemTime,
    last_activity: StdMutex<Instant>,
    next_request_id: AtomicU64,
}

impl Connection {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let name = name.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracker: Arc::new(Tracker::new(name.clone())),
            name,
            transport,
            lifecycle: RwLock::new(Lifecycle {
                state: ConnectionState::New,
                negotiated: None,
                handshake_started: None,
                failure: None,
                timer: None,
            }),
            created_at: SystemTime::now(),
            last_activity: StdMutex::new(Instant::now()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub const fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time since the last message in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    /// Fresh wire ID, unique for the lifetime of this connection.
    pub fn next_request_id(&self) -> RequestId {
        let n = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        RequestId::Number(i64::try_from(n).unwrap_or(i64::MAX))
    }

    pub async fn state(&self) -> ConnectionState {
        self.lifecycle.read().await.state
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == ConnectionState::Ready
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let lc = self.lifecycle.read().await;
        ConnectionSnapshot {
            state: lc.state,
            negotiated: lc.negotiated.clone(),
            handshake_started: lc.handshake_started,
            failure: lc.failure.clone(),
        }
    }

    /// `New` → `Initializing`, arming a timer that fails the handshake
    /// if it has not completed within `timeout`.
    pub async fn start_handshake(self: &Arc<Self>, timeout: Duration) -> Result<(), StateError> {
        let mut lc = self.lifecycle.write().await;
        if lc.state != ConnectionState::New {
            return Err(StateError {
                from: lc.state,
                to: ConnectionState::Initializing,
            });
        }
        lc.state = ConnectionState::Initializing;
        lc.handshake_started = Some(Instant::now());

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = weak.upgrade() {
                // Loses quietly if the handshake already settled.
                let _ = conn
                    .fail_handshake(format!("handshake timed out after {timeout:?}"))
                    .await;
            }
        });
        lc.timer = Some(timer.abort_handle());

        debug!(connection = %self.name, "Handshake started");
        Ok(())
    }

    /// `Initializing` → `Ready`. Fails without side effects from any other state.
    pub async fn complete_handshake(
        &self,
        protocol_version: impl Into<String>,
        capabilities: Value,
        server_info: Option<Value>,
    ) -> Result<(), StateError> {
        let mut lc = self.lifecycle.write().await;
        if lc.state != ConnectionState::Initializing {
            return Err(StateError {
                from: lc.state,
                to: ConnectionState::Ready,
            });
        }
        if let Some(timer) = lc.timer.take() {
            timer.abort();
        }
        let negotiated = Negotiated {
            protocol_version: protocol_version.into(),
            capabilities,
            server_info,
        };
        info!(
            connection = %self.name,
            protocol_version = %negotiated.protocol_version,
            "Connection ready"
        );
        lc.negotiated = Some(negotiated);
        lc.state = ConnectionState::Ready;
        drop(lc);
        self.touch();
        Ok(())
    }

    /// `Initializing` → `Failed`. Only the first caller succeeds.
    pub async fn fail_handshake(&self, reason: impl Into<String>) -> Result<(), StateError> {
        let mut lc = self.lifecycle.write().await;
        if lc.state != ConnectionState::Initializing {
            return Err(StateError {
                from: lc.state,
                to: ConnectionState::Failed,
            });
        }
        if let Some(timer) = lc.timer.take() {
            timer.abort();
        }
        let reason = reason.into();
        warn!(connection = %self.name, reason = %reason, "Handshake failed");
        lc.failure = Some(reason);
        lc.state = ConnectionState::Failed;
        Ok(())
    }

    /// Record a transport-level failure. No-op once `Closed` or `Failed`.
    pub async fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let mut lc = self.lifecycle.write().await;
        if matches!(lc.state, ConnectionState::Closed | ConnectionState::Failed) {
            return false;
        }
        if let Some(timer) = lc.timer.take() {
            timer.abort();
        }
        let reason = reason.into();
        warn!(connection = %self.name, from = %lc.state, reason = %reason, "Connection failed");
        lc.failure = Some(reason);
        lc.state = ConnectionState::Failed;
        true
    }

    /// Move to `Closed`, cancel outstanding requests and close the transport.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        {
            let mut lc = self.lifecycle.write().await;
            if lc.state == ConnectionState::Closed {
                return Ok(());
            }
            if let Some(timer) = lc.timer.take() {
                timer.abort();
            }
            lc.state = ConnectionState::Closed;
        }

        let cancelled = self.tracker.cancel_all(&CancelReason::Shutdown);
        if cancelled > 0 {
            debug!(connection = %self.name, cancelled, "Cancelled outstanding requests");
        }
        info!(connection = %self.name, "Closing connection");
        self.transport.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.transport.kind())
            .finish_non_exhaustive()
    }
}
