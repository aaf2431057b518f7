//! Registry and supervisor for the fleet of server connections.
//!
//! Registry mutations (add, remove, restart, close) are serialized by one
//! mutation lock. Lookups, requests and health checks go straight to the
//! sharded map and never wait on that lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{Config, ConnectionConfig, Timeouts};
use crate::connection::{Connection, ConnectionState, Negotiated};
use crate::error::{CallError, ManagerError};
use crate::router::Router;
use crate::tracker::PendingCall;
use crate::transport::protocol::{Notification, Request, Response};
use crate::transport::{Message, StdioPipeTransport, Transport, TransportKind};

/// A registered connection and what is needed to rebuild it.
struct Entry {
    connection: Arc<Connection>,
    config: ConnectionConfig,
    reader: JoinHandle<()>,
}

/// Point-in-time health of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub connection_id: String,
    pub transport: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub pid: Option<u32>,
    pub protocol_version: Option<String>,
    pub pending_requests: usize,
    pub idle_ms: u64,
    pub exit: Option<String>,
    pub failure: Option<String>,
}

/// Outcome of a broadcast. Partial delivery is normal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    /// Connections whose transport was already down.
    pub skipped: Vec<String>,
    /// Connections where the write itself failed, with the error.
    pub failed: BTreeMap<String, String>,
}

/// Owns every connection and its read loop.
pub struct ConnectionManager {
    entries: DashMap<String, Entry>,
    mutations: Mutex<()>,
    router: Arc<Router>,
    timeouts: Timeouts,
}

impl ConnectionManager {
    pub fn new(router: Arc<Router>, timeouts: Timeouts) -> Self {
        Self {
            entries: DashMap::new(),
            mutations: Mutex::new(()),
            router,
            timeouts,
        }
    }

    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub const fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Build the transport, wrap it in a connection and register it.
    ///
    /// Fails without side effects on a duplicate name, an unsupported
    /// transport kind, or an incomplete configuration.
    pub async fn add_connection(
        &self,
        name: &str,
        config: ConnectionConfig,
    ) -> Result<Arc<Connection>, ManagerError> {
        let _guard = self.mutations.lock().await;
        if self.entries.contains_key(name) {
            return Err(ManagerError::Duplicate(name.to_string()));
        }

        let transport = self.connect(name, &config)?;
        let connection = Arc::new(Connection::new(name, transport));
        let reader = self.router.spawn_read_loop(Arc::clone(&connection));

        info!(
            connection = %name,
            id = %connection.id(),
            pid = ?connection.transport().process_id(),
            "Added connection"
        );
        self.entries.insert(
            name.to_string(),
            Entry {
                connection: Arc::clone(&connection),
                config,
                reader,
            },
        );
        Ok(connection)
    }

    /// Close the connection's transport and drop it from the registry.
    pub async fn remove_connection(&self, name: &str) -> Result<(), ManagerError> {
        let _guard = self.mutations.lock().await;
        let (_, entry) = self
            .entries
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        info!(connection = %name, "Removing connection");
        let result = entry.connection.close().await;
        entry.reader.abort();
        result.map_err(|source| ManagerError::Transport {
            name: name.to_string(),
            source,
        })
    }

    pub fn get_connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.entries.get(name).map(|e| Arc::clone(&e.connection))
    }

    /// Registered names, sorted.
    pub fn list_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Replace the connection's transport with a freshly spawned one.
    ///
    /// The name survives; the connection ID and backing process do not.
    /// The new connection starts in `New` and needs `initialize` again.
    /// If the new transport cannot be built, the old (now closed)
    /// connection stays registered and the error is returned.
    pub async fn restart_connection(&self, name: &str) -> Result<Arc<Connection>, ManagerError> {
        let _guard = self.mutations.lock().await;
        let (old, config) = self
            .entries
            .get(name)
            .map(|e| (Arc::clone(&e.connection), e.config.clone()))
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        if let Err(e) = old.close().await {
            warn!(connection = %name, error = %e, "Error closing connection for restart");
        }

        let transport = self.connect(name, &config)?;
        let connection = Arc::new(Connection::new(name, transport));
        let reader = self.router.spawn_read_loop(Arc::clone(&connection));

        if let Some(previous) = self.entries.insert(
            name.to_string(),
            Entry {
                connection: Arc::clone(&connection),
                config,
                reader,
            },
        ) {
            previous.reader.abort();
        }

        info!(
            connection = %name,
            old_pid = ?old.transport().process_id(),
            new_pid = ?connection.transport().process_id(),
            "Restarted connection"
        );
        Ok(connection)
    }

    /// Run the handshake on a registered connection.
    pub async fn initialize(&self, name: &str) -> Result<Negotiated, ManagerError> {
        let connection = self
            .get_connection(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        self.router
            .initialize(&connection, self.timeouts.handshake)
            .await
            .map_err(|source| ManagerError::Handshake {
                name: name.to_string(),
                source,
            })
    }

    /// Add and initialize every connection in `config`.
    ///
    /// Failures are collected per name; one bad server does not stop the rest.
    pub async fn connect_all(&self, config: &Config) -> Vec<(String, ManagerError)> {
        let mut failures = Vec::new();
        for name in config.connection_names() {
            let conn_config = config.connections[name].clone();
            if let Err(e) = self.add_connection(name, conn_config).await {
                warn!(connection = %name, error = %e, "Failed to add connection");
                failures.push((name.to_string(), e));
                continue;
            }
            if let Err(e) = self.initialize(name).await {
                warn!(connection = %name, error = %e, "Failed to initialize connection");
                failures.push((name.to_string(), e));
            }
        }
        failures
    }

    /// Send `request` to `name` and wait for the response.
    ///
    /// `timeout` defaults to the configured request timeout.
    pub async fn request(
        &self,
        name: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, CallError> {
        let connection = self.resolve(name)?;
        let timeout = timeout.unwrap_or(self.timeouts.request);
        self.router.handle(&connection, request, timeout).await
    }

    /// Send `request` to `name` and return the pending handle.
    pub async fn request_async(&self, name: &str, request: Request) -> Result<PendingCall, CallError> {
        let connection = self.resolve(name)?;
        self.router
            .handle_async(&connection, request, Some(self.timeouts.request))
            .await
    }

    pub async fn notify(&self, name: &str, notification: Notification) -> Result<(), CallError> {
        let connection = self.resolve(name)?;
        self.router.notify(&connection, notification).await
    }

    /// Send `message` to every connected transport.
    ///
    /// Dead transports are skipped and write failures are recorded; neither
    /// fails the broadcast as a whole.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut sends = JoinSet::new();

        for (name, connection) in self.snapshot() {
            if !connection.transport().is_connected() {
                report.skipped.push(name);
                continue;
            }
            let message = message.clone();
            sends.spawn(async move {
                let result = connection.transport().send(&message).await;
                (name, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((name, Ok(()))) => report.delivered.push(name),
                Ok((name, Err(e))) => {
                    debug!(connection = %name, error = %e, "Broadcast delivery failed");
                    report.failed.insert(name, e.to_string());
                }
                Err(e) => warn!(error = %e, "Broadcast task failed"),
            }
        }
        report.delivered.sort_unstable();
        report.skipped.sort_unstable();
        report
    }

    /// Liveness and identity of every connection. Reads only.
    pub async fn health_check(&self) -> Vec<HealthReport> {
        let mut checks = JoinSet::new();
        for (name, connection) in self.snapshot() {
            checks.spawn(async move { check_health(name, &connection).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "Health check failed"),
            }
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Drain buffered stderr lines from `name`'s server.
    pub fn diagnostics(&self, name: &str) -> Option<Vec<String>> {
        self.get_connection(name)
            .map(|c| c.transport().take_diagnostics())
    }

    /// Cancel pending requests whose deadline has passed, on every connection.
    pub fn sweep_expired(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|(_, c)| c.tracker().remove_expired())
            .sum()
    }

    /// Start the background sweeper task.
    ///
    /// Returns a `JoinHandle` that runs until aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.timeouts.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick is immediate, skip it
            loop {
                ticker.tick().await;
                let removed = manager.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired requests");
                }
            }
        })
    }

    /// Tear down every connection.
    ///
    /// Every connection is closed even if some fail; the failures are
    /// reported together.
    pub async fn close(&self) -> Result<(), ManagerError> {
        let _guard = self.mutations.lock().await;
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut closing = JoinSet::new();
        for name in names {
            let Some((_, entry)) = self.entries.remove(&name) else {
                continue;
            };
            info!(connection = %name, "Closing connection");
            closing.spawn(async move {
                let result = entry.connection.close().await;
                entry.reader.abort();
                (name, result)
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => errors.push(format!("{name}: {e}")),
                Err(e) => errors.push(format!("close task failed: {e}")),
            }
        }
        errors.sort();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Shutdown(errors))
        }
    }

    fn resolve(&self, name: &str) -> Result<Arc<Connection>, CallError> {
        self.get_connection(name).ok_or_else(|| CallError::Closed {
            connection: name.to_string(),
            reason: "no such connection".to_string(),
        })
    }

    fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.connection)))
            .collect()
    }

    /// Build the transport for `config`, dispatching on its kind.
    fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn Transport>, ManagerError> {
        match config.transport {
            TransportKind::Stdio => {
                if config.command.trim().is_empty() {
                    return Err(ManagerError::InvalidConfig {
                        name: name.to_string(),
                        reason: "stdio transport requires a command".to_string(),
                    });
                }
                let transport =
                    StdioPipeTransport::spawn(&config.server_command(), self.timeouts.shutdown_grace)
                        .map_err(|source| ManagerError::Transport {
                            name: name.to_string(),
                            source,
                        })?;
                Ok(Arc::new(transport))
            }
            kind @ TransportKind::Sse => Err(ManagerError::UnsupportedTransport {
                name: name.to_string(),
                kind: kind.to_string(),
            }),
        }
    }
}

async fn check_health(name: String, connection: &Connection) -> HealthReport {
    let snapshot = connection.snapshot().await;
    let transport = connection.transport();
    HealthReport {
        connection_id: connection.id().to_string(),
        transport: transport.kind().to_string(),
        state: snapshot.state,
        connected: transport.is_connected(),
        pid: transport.process_id(),
        protocol_version: snapshot.negotiated.map(|n| n.protocol_version),
        pending_requests: connection.tracker().pending_count(),
        idle_ms: u64::try_from(connection.idle_for().as_millis()).unwrap_or(u64::MAX),
        exit: transport.exit_reason().map(|r| r.to_string()),
        failure: snapshot.failure,
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        let timeouts = Timeouts {
            shutdown_grace: Duration::from_millis(200),
            ..Timeouts::default()
        };
        ConnectionManager::new(Arc::new(Router::default()), timeouts)
    }

    fn cat() -> ConnectionConfig {
        ConnectionConfig::stdio("cat", Vec::<String>::new())
    }

    fn sh(script: &str) -> ConnectionConfig {
        ConnectionConfig::stdio("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_duplicate_name_leaves_existing_untouched() {
        let mgr = manager();
        let first = mgr.add_connection("a", cat()).await.unwrap();
        let pid = first.transport().process_id();

        let err = mgr.add_connection("a", cat()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Duplicate(ref n) if n == "a"));

        let still = mgr.get_connection("a").unwrap();
        assert_eq!(still.id(), first.id());
        assert_eq!(still.transport().process_id(), pid);
        assert!(still.transport().is_connected());
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_configs_are_rejected_up_front() {
        let mgr = manager();

        let err = mgr
            .add_connection("empty", ConnectionConfig::stdio("  ", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidConfig { .. }));

        let mut sse = cat();
        sse.transport = TransportKind::Sse;
        let err = mgr.add_connection("remote", sse).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnsupportedTransport { ref kind, .. } if kind == "sse"));

        let err = mgr
            .add_connection("ghost", ConnectionConfig::stdio("/nonexistent/server", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Transport { .. }));

        assert!(mgr.list_connections().is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_fails() {
        let mgr = manager();
        let err = mgr.remove_connection("nope").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_closes_transport() {
        let mgr = manager();
        let conn = mgr.add_connection("a", cat()).await.unwrap();
        mgr.remove_connection("a").await.unwrap();

        assert!(mgr.get_connection("a").is_none());
        assert!(!conn.transport().is_connected());
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_restart_issues_a_new_process() {
        let mgr = manager();
        let before = mgr.add_connection("a", cat()).await.unwrap();
        let after = mgr.restart_connection("a").await.unwrap();

        assert_ne!(before.id(), after.id());
        assert_ne!(
            before.transport().process_id(),
            after.transport().process_id()
        );
        assert_eq!(before.state().await, ConnectionState::Closed);
        assert_eq!(after.state().await, ConnectionState::New);
        assert_eq!(mgr.list_connections(), vec!["a".to_string()]);
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_absent_fails() {
        let mgr = manager();
        assert!(matches!(
            mgr.restart_connection("nope").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_transports() {
        let mgr = manager();
        mgr.add_connection("live", cat()).await.unwrap();
        let dead = mgr.add_connection("dead", sh("exit 0")).await.unwrap();

        for _ in 0..100 {
            if !dead.transport().is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dead.transport().is_connected());

        let report = mgr
            .broadcast(&Message::Notification(Notification::new("notifications/ping", None)))
            .await;
        assert_eq!(report.delivered, vec!["live".to_string()]);
        assert_eq!(report.skipped, vec!["dead".to_string()]);
        assert!(report.failed.is_empty());
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_reports_every_connection() {
        let mgr = manager();
        let a = mgr.add_connection("a", cat()).await.unwrap();
        mgr.add_connection("b", cat()).await.unwrap();

        let reports = mgr.health_check().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "a");
        assert_eq!(reports[0].connection_id, a.id());
        assert_eq!(reports[0].pid, a.transport().process_id());
        assert!(reports[0].connected);
        assert_eq!(reports[0].state, ConnectionState::New);
        assert_eq!(reports[0].transport, "stdio");

        // Reading health does not change anything.
        assert_eq!(mgr.health_check().await.len(), 2);
        assert_eq!(a.state().await, ConnectionState::New);
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_to_unknown_or_unready_connections_fail() {
        let mgr = manager();
        let err = mgr
            .request("nope", Request::new(1, "x", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Closed { .. }));

        mgr.add_connection("a", cat()).await.unwrap();
        let err = mgr
            .request("a", Request::new(2, "x", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NotReady { state: ConnectionState::New, .. }));
        mgr.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_empties_the_registry() {
        let mgr = manager();
        let a = mgr.add_connection("a", cat()).await.unwrap();
        let b = mgr.add_connection("b", cat()).await.unwrap();

        mgr.close().await.unwrap();
        assert!(mgr.list_connections().is_empty());
        assert!(!a.transport().is_connected());
        assert!(!b.transport().is_connected());
    }

    #[tokio::test]
    async fn test_close_shuts_servers_down_concurrently() {
        let mgr = manager();
        let mut conns = Vec::new();
        for i in 0..5 {
            // Ignores stdin, so each close runs the full grace period.
            conns.push(mgr.add_connection(&format!("s{i}"), sh("sleep 30")).await.unwrap());
        }

        let started = std::time::Instant::now();
        mgr.close().await.unwrap();
        let elapsed = started.elapsed();

        // One after another would take at least 5 x 200ms.
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
        assert!(mgr.list_connections().is_empty());
        for conn in conns {
            assert!(!conn.transport().is_connected());
            assert_eq!(conn.state().await, ConnectionState::Closed);
        }
    }
}
