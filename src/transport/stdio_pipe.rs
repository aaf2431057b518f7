//! Stdin/stdout pipe transport for spawned server processes.
//!
//! Owns a child process and speaks newline-delimited JSON-RPC on the child's
//! stdin (outbound) and stdout (inbound). Stderr is drained into a bounded
//! diagnostic buffer and the exit status is awaited by a background task.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, instrument, warn};

use super::protocol::{encode_batch, encode_message};
use super::{
    read_frame, write_frame, ExitReason, Frame, FrameCodec, Message, Transport, TransportKind,
};
use crate::error::TransportError;

/// Lines of peer stderr kept for `take_diagnostics`.
const DIAGNOSTIC_CAPACITY: usize = 256;

/// Default wait between closing stdin and killing the process.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long output already written is still read once the process has exited.
///
/// A descendant holding stdout open would otherwise keep the reader parked.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// What to launch.
#[derive(Debug, Clone, Default)]
pub struct ServerCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ServerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Reader half: decoded messages from a batch frame wait in `backlog`.
struct Inbound {
    frames: FramedRead<ChildStdout, FrameCodec>,
    backlog: VecDeque<Message>,
}

/// Writer half. `torn` is left set when a write is abandoned partway.
struct Outbound {
    stdin: ChildStdin,
    torn: bool,
}

/// What woke a parked reader.
enum Wake {
    Frame(Result<Option<Frame>, TransportError>),
    Exited,
    Closed,
}

/// State shared with the background tasks.
struct Shared {
    connected: AtomicBool,
    closing: AtomicBool,
    diagnostics: StdMutex<VecDeque<String>>,
    exit: watch::Sender<Option<ExitReason>>,
}

/// Transport that communicates with a server via stdin/stdout pipes.
///
/// The process is spawned once and lives until `close()` or until it exits.
/// Writes take the stdin mutex so concurrent callers never interleave
/// frames; reads are expected from a single consumer.
pub struct StdioPipeTransport {
    command: String,
    pid: Option<u32>,
    stdin: Mutex<Option<Outbound>>,
    inbound: Mutex<Inbound>,
    shared: Arc<Shared>,
    kill: StdMutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
    grace: Duration,
}

impl StdioPipeTransport {
    /// Spawn a server process and wire up its pipes.
    ///
    /// Fails if the process cannot be started; no half-built transport is
    /// ever returned.
    #[instrument(skip(server), fields(command = %server.command))]
    pub fn spawn(server: &ServerCommand, grace: Duration) -> Result<Self, TransportError> {
        debug!(args = ?server.args, "Spawning server process");

        let mut cmd = Command::new(&server.command);
        cmd.args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &server.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: server.command.clone(),
            source,
        })?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            let _ = child.start_kill();
            return Err(TransportError::Spawn {
                command: server.command.clone(),
                source: std::io::Error::other("child pipes unavailable"),
            });
        };

        let pid = child.id();
        let (exit, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            diagnostics: StdMutex::new(VecDeque::new()),
            exit,
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(drain_stderr(stderr, Arc::clone(&shared), server.command.clone()));
        tokio::spawn(watch_exit(child, kill_rx, Arc::clone(&shared), server.command.clone()));

        info!(pid = ?pid, "Server process started");

        Ok(Self {
            command: server.command.clone(),
            pid,
            stdin: Mutex::new(Some(Outbound {
                stdin,
                torn: false,
            })),
            inbound: Mutex::new(Inbound {
                frames: FramedRead::new(stdout, FrameCodec::new()),
                backlog: VecDeque::new(),
            }),
            shared,
            kill: StdMutex::new(Some(kill_tx)),
            closed: AtomicBool::new(false),
            grace,
        })
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(self.dead_error());
        }
        let mut stdin = self.stdin.lock().await;
        let out = stdin.as_mut().ok_or(TransportError::Closed)?;
        let result = async {
            if out.torn {
                // End the abandoned partial line so the peer drops only that one.
                write_frame(&mut out.stdin, b"\n").await?;
            }
            out.torn = true;
            write_frame(&mut out.stdin, frame).await?;
            out.torn = false;
            Ok::<_, TransportError>(())
        }
        .await;

        if let Err(e) = &result {
            if e.is_terminal() {
                // Broken pipe: the peer is gone even if exit is not observed yet.
                self.shared.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Next frame from stdout, or an error once the transport is dead.
    ///
    /// The caller must hold the `inbound` lock. Wakes on `close()` and on
    /// process exit; after an exit, output already written is still
    /// delivered for `EXIT_DRAIN` before the exit is reported.
    async fn read_messages(&self, inbound: &mut Inbound) -> Result<Vec<Message>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut exit = self.shared.exit.subscribe();
        let stopped = async {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return Wake::Closed;
                }
                if exit.borrow_and_update().is_some() {
                    return Wake::Exited;
                }
                if exit.changed().await.is_err() {
                    return Wake::Closed;
                }
            }
        };

        let wake = tokio::select! {
            biased;
            frame = read_frame(&mut inbound.frames) => Wake::Frame(frame),
            wake = stopped => wake,
        };
        let frame = match wake {
            Wake::Frame(frame) => frame,
            Wake::Closed => return Err(TransportError::Closed),
            Wake::Exited => tokio::time::timeout(EXIT_DRAIN, read_frame(&mut inbound.frames))
                .await
                .unwrap_or(Ok(None)),
        };

        match frame? {
            Some(frame) => Ok(frame.into_messages()),
            None => {
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(self.dead_error())
            }
        }
    }

    fn dead_error(&self) -> TransportError {
        match *self.shared.exit.borrow() {
            Some(reason) if reason != ExitReason::Terminated => TransportError::Exited(reason),
            _ => TransportError::Closed,
        }
    }

    /// Wait for the exit watcher to record a status, up to `limit`.
    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exit = self.shared.exit.subscribe();
        let waited = tokio::time::timeout(limit, exit.wait_for(Option::is_some)).await;
        waited.is_ok()
    }
}

#[async_trait]
impl Transport for StdioPipeTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame = encode_message(message)?;
        self.write(&frame).await
    }

    async fn send_batch(&self, messages: &[Message]) -> Result<(), TransportError> {
        let frame = encode_batch(messages)?;
        self.write(&frame).await
    }

    async fn receive(&self) -> Result<Message, TransportError> {
        let mut inbound = self.inbound.lock().await;
        if let Some(message) = inbound.backlog.pop_front() {
            return Ok(message);
        }
        let mut messages = self.read_messages(&mut inbound).await?.into_iter();
        let first = messages.next().ok_or(TransportError::Closed)?;
        inbound.backlog.extend(messages);
        Ok(first)
    }

    async fn receive_batch(&self) -> Result<Vec<Message>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        if !inbound.backlog.is_empty() {
            return Ok(inbound.backlog.drain(..).collect());
        }
        self.read_messages(&mut inbound).await
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    ///
    /// Every step runs even if an earlier one fails; all failures are
    /// reported together, first failure first.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        // Wake any reader parked in `read_messages`.
        self.shared.exit.send_modify(|_| {});

        let mut errors = Vec::new();

        // A writer blocked on a full pipe holds the lock; the kill below frees it.
        match tokio::time::timeout(self.grace, self.stdin.lock()).await {
            Ok(mut stdin) => {
                if let Some(mut out) = stdin.take() {
                    if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut out.stdin).await {
                        if e.kind() != std::io::ErrorKind::BrokenPipe {
                            errors.push(format!("closing stdin: {e}"));
                        }
                    }
                }
            }
            Err(_) => debug!(command = %self.command, "Stdin busy, skipping graceful close"),
        }

        if !self.wait_exit(self.grace).await {
            debug!(command = %self.command, pid = ?self.pid, "Grace period elapsed, killing server");
            let kill = self.kill.lock().map(|mut k| k.take()).unwrap_or(None);
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            if !self.wait_exit(self.grace).await {
                errors.push(format!("process {:?} did not exit after kill", self.pid));
            }
        }

        debug!(command = %self.command, pid = ?self.pid, "Server process shut down");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Shutdown(errors))
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        *self.shared.exit.borrow()
    }

    fn take_diagnostics(&self) -> Vec<String> {
        self.shared
            .diagnostics
            .lock()
            .map(|mut d| d.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Forward stderr lines into the diagnostic buffer until EOF.
async fn drain_stderr(stderr: ChildStderr, shared: Arc<Shared>, command: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(command = %command, stderr = %line, "Server diagnostic");
                if let Ok(mut buf) = shared.diagnostics.lock() {
                    if buf.len() == DIAGNOSTIC_CAPACITY {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(command = %command, error = %e, "Stopped reading server stderr");
                break;
            }
        }
    }
}

/// Await process termination exactly once and publish the outcome.
///
/// A message on `kill` (or the transport being dropped) force-kills the child.
async fn watch_exit(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    shared: Arc<Shared>,
    command: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                warn!(command = %command, error = %e, "Failed to kill server process");
            }
            child.wait().await
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    let requested = shared.closing.load(Ordering::SeqCst);
    let reason = match status {
        Ok(status) => ExitReason::from_status(status, requested),
        Err(e) => {
            warn!(command = %command, error = %e, "Failed to wait for server process");
            if requested {
                ExitReason::Terminated
            } else {
                ExitReason::Failed(-1)
            }
        }
    };

    if reason.is_crash() {
        warn!(command = %command, reason = %reason, "Server process crashed");
    } else {
        debug!(command = %command, reason = %reason, "Server process exited");
    }
    shared.exit.send_replace(Some(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::{Notification, Request, RequestId};

    fn sh(script: &str) -> ServerCommand {
        ServerCommand::new("sh").args(["-c", script])
    }

    fn spawn_cat() -> StdioPipeTransport {
        StdioPipeTransport::spawn(&ServerCommand::new("cat"), DEFAULT_SHUTDOWN_GRACE).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_construction_error() {
        let err = StdioPipeTransport::spawn(
            &ServerCommand::new("/nonexistent/definitely-not-a-server"),
            DEFAULT_SHUTDOWN_GRACE,
        )
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cat_echoes_frames_back() {
        let transport = spawn_cat();
        assert!(transport.process_id().is_some());

        let msg = Message::Request(Request::new(1, "echo", None));
        transport.send(&msg).await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), msg);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_batch_messages_are_delivered_one_by_one() {
        let transport = spawn_cat();
        let batch = vec![
            Message::Request(Request::new(1, "a", None)),
            Message::Notification(Notification::new("b", None)),
            Message::Request(Request::new("x", "c", None)),
        ];
        transport.send_batch(&batch).await.unwrap();

        let first = transport.receive().await.unwrap();
        assert_eq!(first, batch[0]);
        let rest = transport.receive_batch().await.unwrap();
        assert_eq!(rest, batch[1..].to_vec());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_exit_flips_liveness() {
        let transport = StdioPipeTransport::spawn(&sh("exit 0"), DEFAULT_SHUTDOWN_GRACE).unwrap();
        assert!(transport.wait_exit(Duration::from_secs(5)).await);

        assert!(!transport.is_connected());
        assert_eq!(transport.exit_reason(), Some(ExitReason::Success));
        let err = transport
            .send(&Message::Request(Request::new(1, "ping", None)))
            .await
            .unwrap_err();
        assert!(err.is_terminal());
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_crash_is_classified() {
        let transport = StdioPipeTransport::spawn(&sh("exit 7"), DEFAULT_SHUTDOWN_GRACE).unwrap();
        assert!(transport.wait_exit(Duration::from_secs(5)).await);
        assert_eq!(transport.exit_reason(), Some(ExitReason::Failed(7)));
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Exited(ExitReason::Failed(7)))
        ));
    }

    #[tokio::test]
    async fn test_stderr_is_collected_as_diagnostics() {
        let transport = StdioPipeTransport::spawn(
            &sh("echo warming up >&2; echo ready >&2; sleep 5"),
            Duration::from_millis(100),
        )
        .unwrap();

        let mut collected = Vec::new();
        for _ in 0..50 {
            collected.extend(transport.take_diagnostics());
            if collected.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(collected, vec!["warming up".to_string(), "ready".to_string()]);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_kills_a_process_that_ignores_stdin() {
        let transport = StdioPipeTransport::spawn(
            &sh("trap '' TERM; while true; do sleep 1; done"),
            Duration::from_millis(100),
        )
        .unwrap();

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.exit_reason(), Some(ExitReason::Terminated));

        // Idempotent.
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_a_pending_reader() {
        let transport = Arc::new(
            StdioPipeTransport::spawn(&sh("sleep 30"), Duration::from_millis(100)).unwrap(),
        );
        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader should wake up")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_abandoned_receive_does_not_corrupt_the_stream() {
        let transport = spawn_cat();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), transport.receive()).await;
        assert!(abandoned.is_err());

        let msg = Message::Request(Request::new(RequestId::String("after".into()), "x", None));
        transport.send(&msg).await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), msg);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_wakes_reader_when_stdout_stays_open() {
        // The background sleep inherits stdout, so no EOF follows the exit.
        let transport = StdioPipeTransport::spawn(&sh("sleep 20 & exit 0"), Duration::from_millis(100))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), transport.receive())
            .await
            .expect("exit should wake the reader");
        assert!(matches!(result, Err(TransportError::Exited(ExitReason::Success))));
        assert!(!transport.is_connected());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_written_before_exit_is_delivered() {
        let transport = StdioPipeTransport::spawn(
            &sh(r#"printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":"bye"}'; sleep 20 & exit 0"#),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(transport.wait_exit(Duration::from_secs(5)).await);

        let Message::Response(response) = transport.receive().await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.id, RequestId::Number(1));
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Exited(ExitReason::Success))
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_not_fatal() {
        let transport = StdioPipeTransport::spawn(
            &sh(r#"printf '\377\376garbage\n{"jsonrpc":"2.0","id":1,"result":true}\n'; sleep 5"#),
            Duration::from_millis(100),
        )
        .unwrap();

        let err = transport.receive().await.unwrap_err();
        assert!(!err.is_terminal(), "{err}");
        assert!(transport.is_connected());

        let Message::Response(response) = transport.receive().await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.result(), Some(&serde_json::Value::Bool(true)));
        transport.close().await.unwrap();
    }
}
