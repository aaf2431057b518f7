//! Request routing and response dispatch.
//!
//! Outbound: check the connection is `Ready`, register with its tracker,
//! then write. Inbound: one read loop per connection writes straight into
//! the tracker, with no intermediate hand-off.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState, Negotiated};
use crate::error::CallError;
use crate::tracker::{CancelReason, PendingCall};
use crate::transport::protocol::{
    ErrorObject, Notification, Request, RequestId, Response, ResponsePayload,
};
use crate::transport::Message;

/// Protocol version offered in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Callback for server notifications: `(connection name, notification)`.
pub type NotificationHandler = Arc<dyn Fn(&str, &Notification) + Send + Sync>;

/// Routes requests to connections and responses back to waiters.
pub struct Router {
    client_name: String,
    handlers: StdRwLock<Vec<NotificationHandler>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new("mcp-orchestrator")
    }
}

impl Router {
    /// `client_name` is reported as `clientInfo.name` during the handshake.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            handlers: StdRwLock::new(Vec::new()),
        }
    }

    /// Register a handler invoked for every server notification.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&str, &Notification) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Send `request` and return the handle its response is delivered to.
    ///
    /// The request goes out under a fresh wire ID; the response handed to
    /// the caller carries the caller's original ID. `deadline` bounds the
    /// write and lets the sweeper reclaim the entry if nobody ever waits on it.
    pub async fn handle_async(
        &self,
        conn: &Connection,
        request: Request,
        deadline: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        ensure_ready(conn).await?;
        let method = request.method.clone();
        let issued = self.issue(conn, &request.method, request.params, deadline);
        let call = match deadline {
            // A peer that stops reading blocks the write; the deadline covers it.
            Some(limit) => tokio::time::timeout(limit, issued)
                .await
                .map_err(|_| CallError::Timeout {
                    method,
                    timeout: limit,
                })??,
            None => issued.await?,
        };
        Ok(call.with_caller_id(request.id))
    }

    /// Send `request` and wait up to `timeout` for its response.
    pub async fn handle(
        &self,
        conn: &Connection,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, CallError> {
        let method = request.method.clone();
        let exchange = async {
            let call = self.handle_async(conn, request, Some(timeout)).await?;
            call.wait(timeout).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| Err(CallError::Timeout { method, timeout }))
    }

    /// Fire-and-forget notification to a `Ready` connection.
    pub async fn notify(&self, conn: &Connection, notification: Notification) -> Result<(), CallError> {
        ensure_ready(conn).await?;
        conn.transport()
            .send(&Message::Notification(notification))
            .await
            .map_err(|e| closed(conn, e.to_string()))?;
        conn.touch();
        Ok(())
    }

    /// Run the capability handshake on a `New` connection.
    ///
    /// The connection's own timer and the wait here share `timeout`;
    /// whichever fires first fails the handshake, the other is a no-op.
    pub async fn initialize(
        &self,
        conn: &Arc<Connection>,
        timeout: Duration,
    ) -> Result<Negotiated, CallError> {
        conn.start_handshake(timeout)
            .await
            .map_err(|e| not_ready(conn, e.from))?;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let exchange = async {
            let call = self
                .issue(conn, "initialize", Some(params), Some(timeout))
                .await?;
            call.wait(timeout).await
        };
        let outcome = tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(CallError::Timeout {
                    method: "initialize".to_string(),
                    timeout,
                })
            });
        let result = match outcome {
            Ok(response) => response.result().cloned().unwrap_or(Value::Null),
            Err(e) => {
                let _ = conn.fail_handshake(e.to_string()).await;
                return Err(e);
            }
        };

        let Some(version) = result.get("protocolVersion").and_then(Value::as_str) else {
            let err = ErrorObject::invalid_request("initialize result lacks protocolVersion");
            let _ = conn.fail_handshake(err.message.clone()).await;
            return Err(CallError::Remote(err));
        };
        let capabilities = result.get("capabilities").cloned().unwrap_or_else(|| json!({}));
        let server_info = result.get("serverInfo").cloned();

        conn.complete_handshake(version, capabilities, server_info)
            .await
            .map_err(|e| not_ready(conn, e.from))?;

        self.notify(conn, Notification::new("notifications/initialized", None))
            .await?;

        let negotiated = conn
            .snapshot()
            .await
            .negotiated
            .ok_or_else(|| not_ready(conn, ConnectionState::Ready))?;
        Ok(negotiated)
    }

    /// Start the inbound read loop for `conn`.
    pub fn spawn_read_loop(self: &Arc<Self>, conn: Arc<Connection>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move { router.read_loop(conn).await })
    }

    /// Register first, write second; a failed write cancels the entry.
    async fn issue(
        &self,
        conn: &Connection,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
    ) -> Result<PendingCall, CallError> {
        let wire_id = conn.next_request_id();
        let call = conn
            .tracker()
            .register(wire_id.clone(), method, deadline)
            .map_err(|id| closed(conn, format!("correlation id {id} already outstanding")))?;

        let request = Request::new(wire_id.clone(), method, params);
        if let Err(e) = conn.transport().send(&Message::Request(request)).await {
            let reason = e.to_string();
            conn.tracker()
                .cancel(&wire_id, CancelReason::SendFailed(reason.clone()));
            return Err(closed(conn, reason));
        }
        conn.touch();

        // Closed while we were writing: its cancel sweep may have missed us.
        if conn.state().await == ConnectionState::Closed {
            conn.tracker().cancel(&wire_id, CancelReason::Shutdown);
        }
        Ok(call)
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>) {
        debug!(connection = %conn.name(), "Read loop started");
        loop {
            match conn.transport().receive_batch().await {
                Ok(messages) => {
                    conn.touch();
                    for message in messages {
                        self.dispatch(&conn, message).await;
                    }
                }
                Err(e) if !e.is_terminal() => {
                    warn!(connection = %conn.name(), error = %e, "Dropping malformed frame");
                }
                Err(e) => {
                    let reason = e.to_string();
                    conn.mark_failed(&reason).await;
                    let cancelled = conn
                        .tracker()
                        .cancel_all(&CancelReason::ConnectionLost(reason.clone()));
                    info!(
                        connection = %conn.name(),
                        reason = %reason,
                        cancelled,
                        "Read loop stopped"
                    );
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, conn: &Connection, message: Message) {
        match message {
            Message::Response(Response { id: RequestId::Null, payload }) => {
                warn!(connection = %conn.name(), payload = ?payload, "Uncorrelated response from server");
            }
            Message::Response(Response { id, payload }) => match payload {
                ResponsePayload::Result(value) => {
                    conn.tracker().complete(&id, value);
                }
                ResponsePayload::Error(error) => {
                    conn.tracker().fail(&id, error);
                }
            },
            Message::Notification(notification) => {
                let handlers = self
                    .handlers
                    .read()
                    .map(|h| h.clone())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    debug!(connection = %conn.name(), method = %notification.method, "Unhandled notification");
                }
                for handler in handlers {
                    handler(conn.name(), &notification);
                }
            }
            Message::Request(request) => {
                let response = if request.method == "ping" {
                    Response::success(request.id, json!({}))
                } else {
                    debug!(connection = %conn.name(), method = %request.method, "Rejecting server request");
                    Response::error(request.id, ErrorObject::method_not_found(&request.method))
                };
                if let Err(e) = conn.transport().send(&Message::Response(response)).await {
                    warn!(connection = %conn.name(), error = %e, "Failed to answer server request");
                }
            }
        }
    }
}

async fn ensure_ready(conn: &Connection) -> Result<(), CallError> {
    match conn.state().await {
        ConnectionState::Ready => Ok(()),
        ConnectionState::Closed => Err(closed(conn, "connection closed".to_string())),
        state => Err(not_ready(conn, state)),
    }
}

fn not_ready(conn: &Connection, state: ConnectionState) -> CallError {
    CallError::NotReady {
        connection: conn.name().to_string(),
        state,
    }
}

fn closed(conn: &Connection, reason: String) -> CallError {
    CallError::Closed {
        connection: conn.name().to_string(),
        reason,
    }
}
