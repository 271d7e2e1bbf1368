//! Typed error definitions for the streamer client.
//!
//! Provides [`TdsError`] for every failure kind a session can surface. All
//! variants implement `std::error::Error` via `thiserror`, so they integrate
//! with `anyhow::Result` in the binary. The enum is `Clone` because one
//! session failure is fanned out to every caller waiting on that session.

use thiserror::Error;

/// Result alias used by the library crates.
pub type Result<T> = std::result::Result<T, TdsError>;

/// Domain-specific errors for the streamer client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TdsError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Connect, read, or write failure on the socket. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or record.
    #[error("decode error: {0}")]
    Decode(String),

    /// The server answered LOGIN with a non-zero code.
    #[error("login rejected (code {code}): {msg}")]
    LoginRejected { code: i64, msg: String },

    /// The server answered a non-login command with a non-zero code.
    #[error("{command} rejected (code {code}): {msg}")]
    Rejected {
        command: String,
        code: i64,
        msg: String,
    },

    /// The `(service, symbol, subscriber)` triple is already registered.
    #[error("'{subscriber}' already subscribed to {service}/{symbol}; use a unique subscriber name")]
    SubscriberConflict {
        service: String,
        symbol: String,
        subscriber: String,
    },

    /// The session has been logged out or shut down.
    #[error("session closed")]
    SessionClosed,

    /// No response arrived for a request within the configured timeout.
    #[error("request {request_id} timed out")]
    Timeout { request_id: u64 },

    /// Operation not valid in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Principal could not be obtained or is incomplete.
    #[error("principal error: {0}")]
    Principal(String),
}
