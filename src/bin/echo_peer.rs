//! mcp-echo-peer
//!
//! Minimal newline-delimited JSON-RPC peer used to exercise the orchestrator.
//!
//! - `initialize` answers with a fixed protocol version and server info
//! - `echo` returns its params as the result
//! - `sleep` waits `params.ms` milliseconds, then echoes
//! - `fail` returns a tool execution error
//! - `exit` exits cleanly without answering, `crash` exits with status 3
//!
//! Each request is answered from its own thread, so slow requests do not
//! hold up fast ones and responses can arrive out of order.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

fn main() {
    eprintln!("mcp-echo-peer ready");

    let stdout = Arc::new(Mutex::new(io::stdout()));
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Array(batch)) => {
                let replies: Vec<Value> = batch.iter().filter_map(answer).collect();
                if !replies.is_empty() {
                    emit(&stdout, &Value::Array(replies));
                }
            }
            Ok(message) => {
                let stdout = Arc::clone(&stdout);
                thread::spawn(move || {
                    if let Some(reply) = answer(&message) {
                        emit(&stdout, &reply);
                    }
                });
            }
            Err(e) => emit(
                &stdout,
                &json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": -32700, "message": format!("Parse error: {e}")},
                }),
            ),
        }
    }
}

fn emit(stdout: &Mutex<io::Stdout>, value: &Value) {
    let Ok(mut out) = stdout.lock() else { return };
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}

/// Build the reply to one message; notifications get none.
fn answer(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": params
                .get("protocolVersion")
                .cloned()
                .unwrap_or_else(|| json!("2024-11-05")),
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcp-echo-peer", "version": env!("CARGO_PKG_VERSION")},
        })),
        "ping" => Ok(json!({})),
        "echo" => Ok(params),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(ms));
            Ok(params)
        }
        "fail" => Err(json!({"code": -32004, "message": "Tool execution failed", "data": params})),
        "exit" => std::process::exit(0),
        "crash" => {
            eprintln!("mcp-echo-peer crashing on request");
            std::process::exit(3)
        }
        other => Err(json!({"code": -32601, "message": format!("Method not found: {other}")})),
    };

    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
    })
}
