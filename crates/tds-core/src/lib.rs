//! # tds-core
//!
//! Core crate for the streamer client, providing:
//!
//! - **Types** (`types`): service/command/QoS enums and the session [`Principal`]
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `TdsError` via thiserror
//! - **Transport** (`ws`): frame sink/source traits, WebSocket and in-memory transports
//! - **Time utilities** (`time_util`): epoch-millisecond conversions
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
