//! mcp-orchestrator
//!
//! Connects to the configured MCP servers and runs one operation against
//! the fleet. Configuration comes from `--config` or `MCP_ORCHESTRATOR_CONFIG`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcp_orchestrator::config::Config;
use mcp_orchestrator::manager::ConnectionManager;
use mcp_orchestrator::router::Router;
use mcp_orchestrator::transport::protocol::{Notification, Request};
use mcp_orchestrator::transport::Message;

#[derive(Parser, Debug)]
#[command(name = "mcp-orchestrator")]
#[command(about = "Multiplex JSON-RPC calls across MCP server processes")]
struct Args {
    /// JSON configuration file (defaults to $MCP_ORCHESTRATOR_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every server and print its health as JSON
    Health,

    /// Send one request and print the response
    Call {
        connection: String,
        method: String,

        /// Request params as JSON
        #[arg(long)]
        params: Option<String>,

        /// Override the configured request timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send a notification to every live server
    Broadcast {
        method: String,

        /// Notification params as JSON
        #[arg(long)]
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(connections = ?config.connection_names(), "Loaded configuration");

    let manager = Arc::new(ConnectionManager::new(
        Arc::new(Router::default()),
        config.timeouts(),
    ));
    let sweeper = manager.start_sweeper();

    for (name, err) in manager.connect_all(&config).await {
        warn!(connection = %name, error = %err, "Connection unavailable");
    }

    let outcome = run(&manager, args.command).await;

    sweeper.abort();
    if let Err(e) = manager.close().await {
        warn!(error = %e, "Errors during shutdown");
    }
    outcome
}

async fn run(manager: &ConnectionManager, command: Command) -> Result<()> {
    match command {
        Command::Health => {
            let reports = manager.health_check().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Call {
            connection,
            method,
            params,
            timeout_ms,
        } => {
            let params = parse_params(params.as_deref())?;
            let response = manager
                .request(
                    &connection,
                    Request::new(1, method, params),
                    timeout_ms.map(Duration::from_millis),
                )
                .await
                .with_context(|| format!("Request to {connection} failed"))?;
            let message = Message::Response(response);
            println!("{}", serde_json::to_string_pretty(&message.to_value())?);
        }
        Command::Broadcast { method, params } => {
            let params = parse_params(params.as_deref())?;
            let report = manager
                .broadcast(&Message::Notification(Notification::new(method, params)))
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(s).context("--params is not valid JSON"))
        .transpose()
}
