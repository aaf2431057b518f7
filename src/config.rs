//! Configuration for the orchestrator.
//!
//! A JSON document naming each server connection and the timeouts used by
//! the router and manager. It can be read from a file or passed inline via
//! the `MCP_ORCHESTRATOR_CONFIG` environment variable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::transport::stdio_pipe::ServerCommand;
use crate::transport::TransportKind;

/// Environment variable holding an inline JSON configuration.
pub const CONFIG_ENV: &str = "MCP_ORCHESTRATOR_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server connections, keyed by name.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,

    /// Timeout settings (optional).
    #[serde(default)]
    pub timeouts: Option<TimeoutsFile>,
}

/// How to reach one server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Which transport to use ("stdio" or "sse").
    pub transport: TransportKind,

    /// Executable to launch (stdio transport).
    #[serde(default)]
    pub command: String,

    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the server process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Endpoint URL (sse transport).
    #[serde(default)]
    pub url: Option<String>,
}

impl ConnectionConfig {
    /// A stdio connection running `command` with `args`.
    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport: TransportKind::Stdio,
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
        }
    }

    /// Process launch parameters for the stdio transport.
    pub fn server_command(&self) -> ServerCommand {
        ServerCommand {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// Timeout settings as written in the configuration file (milliseconds).
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsFile {
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,

    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Interval of the expired-request sweeper.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Parsed timeouts with `Duration` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Default deadline for a single request.
    pub request: Duration,

    /// How long a server may take to answer `initialize`.
    pub handshake: Duration,

    /// Wait between closing a server's stdin and killing it.
    pub shutdown_grace: Duration,

    /// Interval between sweeps for expired pending requests.
    pub sweep_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_millis(default_request_ms()),
            handshake: Duration::from_millis(default_handshake_ms()),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            sweep_interval: Duration::from_millis(default_sweep_interval_ms()),
        }
    }
}

impl Timeouts {
    /// Create from the configuration file values.
    pub const fn from_file(file: &TimeoutsFile) -> Self {
        Self {
            request: Duration::from_millis(file.request_ms),
            handshake: Duration::from_millis(file.handshake_ms),
            shutdown_grace: Duration::from_millis(file.shutdown_grace_ms),
            sweep_interval: Duration::from_millis(file.sweep_interval_ms),
        }
    }

    /// Apply `MCP_ORCHESTRATOR_REQUEST_TIMEOUT_MS` and
    /// `MCP_ORCHESTRATOR_HANDSHAKE_TIMEOUT_MS` on top of `self`.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        Self {
            request: env_millis("MCP_ORCHESTRATOR_REQUEST_TIMEOUT_MS").unwrap_or(self.request),
            handshake: env_millis("MCP_ORCHESTRATOR_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(self.handshake),
            ..self
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

impl Config {
    /// Load configuration from the `MCP_ORCHESTRATOR_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let json = std::env::var(CONFIG_ENV).with_context(|| format!("{CONFIG_ENV} not set"))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), connections = config.connections.len(), "Loaded config file");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Effective timeouts: file values (or defaults) plus env overrides.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
            .as_ref()
            .map_or_else(Timeouts::default, Timeouts::from_file)
            .with_env_overrides()
    }

    /// Connection names in a stable order.
    pub fn connection_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

const fn default_request_ms() -> u64 {
    30_000
}

const fn default_handshake_ms() -> u64 {
    10_000
}

const fn default_shutdown_grace_ms() -> u64 {
    2_000
}

const fn default_sweep_interval_ms() -> u64 {
    5_000
}
