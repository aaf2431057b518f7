//! mcp-orchestrator library
//!
//! Multiplexes JSON-RPC calls across a fleet of supervised MCP servers:
//! - Newline-delimited JSON-RPC 2.0 codec and a subprocess transport
//! - Per-connection correlation of requests and responses
//! - Connection lifecycle with a timed capability handshake
//! - A manager that adds, restarts, health-checks and tears down servers

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod router;
pub mod tracker;
pub mod transport;
