//! Wire protocol shared with the streamer.
//!
//! # Outbound
//!
//! ```json
//! {"requests":[{"service":"QUOTE","command":"SUBS","requestid":3,
//!               "account":"123","source":"APP1","parameters":{"keys":"SPY"}}]}
//! ```
//!
//! Exactly one request per envelope, with `requestid` as a JSON number.
//!
//! # Inbound
//!
//! ```json
//! {"response":[{"service":"ADMIN","command":"LOGIN","timestamp":1590000000000,
//!               "requestid":"0","content":{"code":0,"msg":"ok"}}],
//!  "notify":[{"heartbeat":"1590000000000"}],
//!  "data":[{"service":"QUOTE","command":"SUBS","timestamp":1590000000000,
//!           "content":[{"key":"SPY","1":301.5},{"key":"QQQ","1":230.1}]}]}
//! ```
//!
//! Any of the three arrays may be absent, `null`, or empty. Each unit is
//! decoded on its own so one malformed unit does not discard the rest of the
//! frame.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tds_core::error::{Result, TdsError};
use tds_core::time_util::deserialize_epoch_ms;
use tds_core::{Command, Service};
use tracing::debug;

use crate::json_util::{self, deserialize_i64_lenient, deserialize_u64_lenient};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A command before the session stamps it with a correlation id and the
/// principal's account/source identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub service: Service,
    pub command: Command,
    pub parameters: BTreeMap<String, String>,
}

impl OutboundCommand {
    pub fn new(service: Service, command: Command) -> Self {
        Self {
            service,
            command,
            parameters: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// LOGIN is the only command allowed through before the session is ready.
    pub fn is_login(&self) -> bool {
        self.service == Service::Admin && self.command == Command::Login
    }

    pub fn into_request(self, request_id: u64, account: &str, source: &str) -> Request {
        Request {
            service: self.service,
            command: self.command,
            request_id,
            account: account.to_string(),
            source: source.to_string(),
            parameters: self.parameters,
        }
    }
}

/// One request unit as written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub service: Service,
    pub command: Command,
    #[serde(rename = "requestid")]
    pub request_id: u64,
    pub account: String,
    pub source: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    requests: [&'a Request; 1],
}

/// Serialize a request into its single-request envelope.
pub fn encode_request(request: &Request) -> Result<String> {
    serde_json::to_string(&RequestEnvelope { requests: [request] })
        .map_err(|e| TdsError::Decode(format!("encode request {}: {e}", request.request_id)))
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Acknowledgement content carried by every response unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ack {
    #[serde(deserialize_with = "deserialize_i64_lenient")]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl Ack {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// A response to a previously sent request.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub service: Service,
    pub command: Command,
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "requestid", deserialize_with = "deserialize_u64_lenient")]
    pub request_id: u64,
    pub content: Ack,
}

/// Response content classified by the command it acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Login(Ack),
    Logout(Ack),
    Qos(Ack),
    Subs(Ack),
    Other { command: Command, ack: Ack },
}

impl Response {
    pub fn acknowledgement(&self) -> Acknowledgement {
        let ack = self.content.clone();
        match self.command {
            Command::Login => Acknowledgement::Login(ack),
            Command::Logout => Acknowledgement::Logout(ack),
            Command::Qos => Acknowledgement::Qos(ack),
            Command::Subs => Acknowledgement::Subs(ack),
            ref other => Acknowledgement::Other {
                command: other.clone(),
                ack,
            },
        }
    }
}

/// Just the correlation id of a response unit whose body failed to decode.
#[derive(Deserialize)]
struct ResponseId {
    #[serde(rename = "requestid", deserialize_with = "deserialize_u64_lenient")]
    request_id: u64,
}

#[derive(Deserialize)]
struct Heartbeat {
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    heartbeat: DateTime<Utc>,
}

/// A batch of push records for one service.
#[derive(Debug, Clone, Deserialize)]
pub struct DataUnit {
    pub service: Service,
    pub command: Command,
    #[serde(deserialize_with = "deserialize_epoch_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: Vec<Value>,
}

impl DataUnit {
    /// Split the batch into single-record [`PushRecord`]s.
    ///
    /// Records that are not objects or lack a non-empty string `key` are
    /// skipped; the second element of the tuple counts them.
    pub fn into_records(self) -> (Vec<PushRecord>, usize) {
        let DataUnit { service, command, timestamp, content } = self;
        let mut records = Vec::with_capacity(content.len());
        let mut skipped = 0;

        for raw in content {
            let Value::Object(fields) = raw else {
                skipped += 1;
                continue;
            };
            let Some(key) = fields.get("key").and_then(Value::as_str).filter(|k| !k.is_empty()).map(str::to_string)
            else {
                skipped += 1;
                continue;
            };
            records.push(PushRecord {
                service: service.clone(),
                command: command.clone(),
                timestamp,
                key,
                content: fields,
            });
        }

        (records, skipped)
    }
}

/// One decoded update for a single symbol.
#[derive(Debug, Clone, Serialize)]
pub struct PushRecord {
    pub service: Service,
    pub command: Command,
    pub timestamp: DateTime<Utc>,
    /// Symbol the record belongs to (the record's `key` field).
    pub key: String,
    /// The record's fields, keyed by numeric field index as a string.
    pub content: Map<String, Value>,
}

impl PushRecord {
    /// Raw value of a numeric field index.
    pub fn field(&self, index: u16) -> Option<&Value> {
        self.content.get(index.to_string().as_str())
    }

    pub fn field_f64(&self, index: u16) -> Option<f64> {
        json_util::parse_str_f64(self.field(index))
    }

    pub fn field_u64(&self, index: u16) -> Option<u64> {
        json_util::parse_str_u64(self.field(index))
    }

    pub fn field_str(&self, index: u16) -> Option<&str> {
        self.field(index).and_then(Value::as_str)
    }
}

/// Everything decoded from one inbound frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub responses: Vec<Response>,
    pub heartbeats: Vec<DateTime<Utc>>,
    pub data: Vec<DataUnit>,
    /// Response units with a readable `requestid` but an invalid body, with
    /// the decode error. Their pending requests still have to be settled.
    pub malformed_responses: Vec<(u64, String)>,
    /// Units that failed to decode and were dropped.
    pub skipped: usize,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    response: Option<Vec<Value>>,
    #[serde(default)]
    notify: Option<Vec<Value>>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

/// Decode one inbound text frame.
///
/// Returns `Err` only if the frame itself is not a JSON object of the expected
/// shape; individually malformed units are counted in
/// [`DecodedFrame::skipped`].
pub fn decode_frame(text: &str) -> Result<DecodedFrame> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|e| TdsError::Decode(format!("frame: {e}")))?;
    let mut frame = DecodedFrame::default();

    for unit in raw.response.unwrap_or_default() {
        match Response::deserialize(&unit) {
            Ok(resp) => frame.responses.push(resp),
            Err(e) => match ResponseId::deserialize(&unit) {
                Ok(ResponseId { request_id }) => {
                    debug!("[proto] response #{request_id} has an invalid body: {e}");
                    frame.malformed_responses.push((request_id, e.to_string()));
                }
                Err(_) => {
                    debug!("[proto] skipping response unit: {e}");
                    frame.skipped += 1;
                }
            },
        }
    }

    for unit in raw.notify.unwrap_or_default() {
        match serde_json::from_value::<Heartbeat>(unit) {
            Ok(hb) => frame.heartbeats.push(hb.heartbeat),
            Err(e) => {
                debug!("[proto] skipping notify unit: {e}");
                frame.skipped += 1;
            }
        }
    }

    for unit in raw.data.unwrap_or_default() {
        match serde_json::from_value::<DataUnit>(unit) {
            Ok(data) => frame.data.push(data),
            Err(e) => {
                debug!("[proto] skipping data unit: {e}");
                frame.skipped += 1;
            }
        }
    }

    Ok(frame)
}
