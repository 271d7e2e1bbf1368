//! Epoch-millisecond time utilities.
//!
//! The streamer encodes every instant (response timestamps, heartbeats, the
//! token issue time inside the login credential) as milliseconds since the
//! Unix epoch, sometimes as a JSON number and sometimes as a quoted string.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, de};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Convert epoch milliseconds to a UTC instant.
///
/// Returns `None` when the value is outside chrono's representable range.
#[inline]
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Parse an epoch-millisecond string such as `"1577836800123"`.
///
/// Surrounding quotes are tolerated.
pub fn parse_epoch_ms(s: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = s.trim().trim_matches('"').parse().ok()?;
    from_epoch_ms(ms)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MillisRepr {
    Num(i64),
    Str(String),
}

/// Serde `deserialize_with` helper accepting epoch milliseconds as either a
/// JSON number or a numeric string.
pub fn deserialize_epoch_ms<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match MillisRepr::deserialize(deserializer)? {
        MillisRepr::Num(ms) => from_epoch_ms(ms),
        MillisRepr::Str(s) => parse_epoch_ms(&s),
    };
    parsed.ok_or_else(|| de::Error::custom("invalid epoch-millisecond timestamp"))
}
