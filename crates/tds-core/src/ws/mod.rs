//! Duplex message transport consumed by the streaming session.
//!
//! The session never touches a socket directly: it writes through a
//! [`FrameSink`] (guarded so only one writer is active at a time) and a single
//! dispatcher task reads from the matching [`FrameSource`].

pub mod client;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the write half. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a transport.
///
/// `next_text` must be cancel-safe: the dispatcher polls it inside
/// `tokio::select!` alongside its shutdown signal.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next text frame, `Some(Err)` on read failure, `None` once the peer has
    /// closed the stream.
    async fn next_text(&mut self) -> Option<Result<String>>;
}

pub use client::{WsSink, WsSource, connect};
pub use memory::{MemoryPeer, MemorySink, MemorySource};
