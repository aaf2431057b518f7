//! In-memory transport for router and manager tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::{Frame, Message, Transport, TransportKind};
use crate::error::TransportError;

/// Transport whose peer is the test itself.
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    backlog: StdMutex<VecDeque<Message>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

/// The far end of a `MemoryTransport`.
pub struct Peer {
    /// Everything the transport sent, in order.
    pub sent: mpsc::UnboundedReceiver<Message>,
    /// Frames to hand to the transport's reader.
    pub inject: mpsc::UnboundedSender<Frame>,
}

impl Peer {
    /// Push a single message to the transport's reader.
    pub fn reply(&self, message: impl Into<Message>) {
        let _ = self.inject.send(Frame::Single(message.into()));
    }
}

pub fn pair() -> (MemoryTransport, Peer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(false);
    (
        MemoryTransport {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            backlog: StdMutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            closed,
        },
        Peer {
            sent: out_rx,
            inject: in_tx,
        },
    )
}

impl MemoryTransport {
    async fn next_frame(&self) -> Result<Vec<Message>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
            frame = inbound.recv() => match frame {
                Some(frame) => Ok(frame.into_messages()),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::Closed)
                }
            },
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn send_batch(&self, messages: &[Message]) -> Result<(), TransportError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Message, TransportError> {
        if let Some(message) = self.backlog.lock().unwrap().pop_front() {
            return Ok(message);
        }
        let mut messages = self.next_frame().await?.into_iter();
        let first = messages.next().ok_or(TransportError::Closed)?;
        self.backlog.lock().unwrap().extend(messages);
        Ok(first)
    }

    async fn receive_batch(&self) -> Result<Vec<Message>, TransportError> {
        let buffered: Vec<_> = self.backlog.lock().unwrap().drain(..).collect();
        if !buffered.is_empty() {
            return Ok(buffered);
        }
        self.next_frame().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}
