//! In-process transport backed by unbounded channels.
//!
//! [`pair`] returns the session-side [`MemorySink`]/[`MemorySource`] and the
//! [`MemoryPeer`] that plays the server: it observes every frame the session
//! writes and injects inbound frames or read failures. Dropping the peer ends
//! the stream, which the session treats like a closed socket.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource};
use crate::error::{Result, TdsError};

/// Session-side write half.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
    closed: bool,
}

/// Session-side read half.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

/// Server-side end of an in-memory transport.
pub struct MemoryPeer {
    written: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<String>>,
}

/// Create a connected in-memory transport.
pub fn pair() -> (MemorySink, MemorySource, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemorySink { tx: out_tx, closed: false },
        MemorySource { rx: in_rx },
        MemoryPeer { written: out_rx, inbound: in_tx },
    )
}

impl MemoryPeer {
    /// Next frame written by the session, or `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.written.recv().await
    }

    /// A frame written by the session, if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.written.try_recv().ok()
    }

    /// Deliver an inbound text frame to the session.
    pub fn push(&self, text: impl Into<String>) -> Result<()> {
        self.inbound
            .send(Ok(text.into()))
            .map_err(|_| TdsError::Transport("session source dropped".into()))
    }

    /// Make the session's next read fail.
    pub fn fail(&self, err: TdsError) -> Result<()> {
        self.inbound
            .send(Err(err))
            .map_err(|_| TdsError::Transport("session source dropped".into()))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(TdsError::Transport("sink closed".into()));
        }
        self.tx
            .send(text)
            .map_err(|_| TdsError::Transport("peer hung up".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_text(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}
