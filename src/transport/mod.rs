//! Transport layer for orchestrator ↔ server communication.
//!
//! Provides the `Transport` trait and newline-delimited JSON framing functions.
//! `StdioPipeTransport` (stdin/stdout pipes to a spawned server) is the only
//! concrete variant; an SSE/HTTP variant is recognised by configuration but
//! not implemented.

pub mod protocol;
pub mod stdio_pipe;

#[cfg(test)]
pub(crate) mod memory;

pub use protocol::{Frame, Message};
pub use stdio_pipe::StdioPipeTransport;

use std::fmt;
use std::process::ExitStatus;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use crate::error::{ProtocolError, TransportError};

/// Maximum frame size (64 MB). Safety valve against malformed peers.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Transport variants selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout.
    Stdio,
    /// Server-sent events over HTTP. Not implemented yet.
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

/// Why a peer process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited on its own with status 0.
    Success,
    /// Exited on its own with a non-zero status.
    Failed(i32),
    /// Killed by a signal nobody here sent.
    Signalled(i32),
    /// Stopped because the transport was closed.
    Terminated,
}

impl ExitReason {
    /// Classify a wait status. `requested` is set when the orchestrator
    /// itself initiated the shutdown.
    pub fn from_status(status: ExitStatus, requested: bool) -> Self {
        if requested {
            return Self::Terminated;
        }
        if let Some(code) = status.code() {
            return if code == 0 {
                Self::Success
            } else {
                Self::Failed(code)
            };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::Signalled(sig);
            }
        }
        Self::Failed(-1)
    }

    /// Unexpected termination, as opposed to a clean or requested stop.
    pub const fn is_crash(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Signalled(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("exited normally"),
            Self::Failed(code) => write!(f, "exited with status {code}"),
            Self::Signalled(sig) => write!(f, "killed by signal {sig}"),
            Self::Terminated => f.write_str("terminated by orchestrator"),
        }
    }
}

/// Abstraction over orchestrator ↔ server channels.
///
/// Implementations handle connection-specific details (pipes, sockets)
/// while the router and manager work with this uniform interface.
/// Once `is_connected` returns false it never returns true again, and
/// every later `send`/`receive` fails.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message. Concurrent senders never interleave frames.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Write several messages as a single batch frame.
    async fn send_batch(&self, messages: &[Message]) -> Result<(), TransportError>;

    /// Read the next message. Messages of a batch frame are returned one by one.
    ///
    /// Cancellation safe: dropping the future never loses or splits a frame.
    async fn receive(&self) -> Result<Message, TransportError>;

    /// Read the next frame as a list (a single message yields a list of one).
    async fn receive_batch(&self) -> Result<Vec<Message>, TransportError>;

    /// Shut the transport down. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;

    /// OS process backing this transport, if any.
    fn process_id(&self) -> Option<u32> {
        None
    }

    /// How the backing process ended, once it has.
    fn exit_reason(&self) -> Option<ExitReason> {
        None
    }

    /// Drain diagnostic lines reported by the peer (e.g. its stderr).
    fn take_diagnostics(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Write one encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), TransportError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Newline-delimited frame decoder with a bounded line length.
///
/// Lines that are too long or not UTF-8 come out as a `ProtocolError` item
/// and decoding resumes at the next newline; only I/O failures end the stream.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_SIZE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn item(
        &self,
        buf: &BytesMut,
        line: Result<String, LinesCodecError>,
    ) -> Option<Result<Frame, ProtocolError>> {
        match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(protocol::decode_frame(&line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(ProtocolError::FrameTooLarge {
                len: buf.len(),
                max: self.max_length,
            })),
            // The codec's only I/O error is invalid UTF-8; the line is already consumed.
            Err(LinesCodecError::Io(_)) => Some(Err(ProtocolError::NotUtf8)),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, ProtocolError>;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(line) = self.lines.decode(buf).transpose() else {
                return Ok(None);
            };
            if let Some(item) = self.item(buf, line) {
                return Ok(Some(item));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(line) = self.lines.decode_eof(buf).transpose() else {
                return Ok(None);
            };
            if let Some(item) = self.item(buf, line) {
                return Ok(Some(item));
            }
        }
    }
}

/// Read and decode the next non-blank frame.
///
/// Returns `Ok(None)` at end of stream. `FramedRead` keeps partial input in
/// its own buffer, so an abandoned read leaves the stream intact.
pub async fn read_frame<R: AsyncRead + Unpin>(
    frames: &mut FramedRead<R, FrameCodec>,
) -> Result<Option<Frame>, TransportError> {
    match frames.next().await {
        None => Ok(None),
        Some(Ok(item)) => Ok(Some(item?)),
        Some(Err(e)) => Err(e),
    }
}
