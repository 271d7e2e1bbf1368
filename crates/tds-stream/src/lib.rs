//! # tds-stream
//!
//! Streaming session client for the market-data push protocol.
//!
//! ## Architecture
//!
//! A [`StreamSession`] owns one transport. Outbound commands get a request id
//! from the [`correlation`] table and are written once the session is logged
//! in. A single dispatcher task reads every inbound frame, completes pending
//! requests by id and hands data records to the [`registry`], which fans them
//! out to the subscribers of each `(service, symbol)`.
//!
//! - [`session`]: lifecycle, login gating, subscribe/QoS/stop
//! - [`handshake`]: LOGIN/LOGOUT/QOS/SUBS builders
//! - [`proto`]: request encoding and inbound frame decoding
//! - [`correlation`]: request id → pending callback
//! - [`registry`]: subscription dedup and fan-out
//! - [`principal`]: where the login principal comes from
//! - [`json_util`]: lenient numeric parsing for wire fields

pub mod correlation;
mod dispatcher;
pub mod handshake;
pub mod json_util;
pub mod principal;
pub mod proto;
pub mod registry;
pub mod session;

pub use principal::{FilePrincipalProvider, PrincipalProvider, RestPrincipalProvider};
pub use proto::{OutboundCommand, PushRecord};
pub use session::{CloseReason, SessionState, StreamSession};
