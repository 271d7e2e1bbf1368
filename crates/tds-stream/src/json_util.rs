//! Lenient JSON number helpers.
//!
//! The streamer is inconsistent about numeric encoding: the same field may
//! arrive as a native number in one frame and as a quoted string in another
//! (`requestid` is always quoted on the way back, record fields vary by
//! service). These helpers accept both.

use serde::{Deserialize, Deserializer, de};
use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.trim().parse().ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.trim().parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a JSON value (string or number) as `i64`.
///
/// Integral floats such as `0.0` are accepted.
#[inline]
pub fn parse_str_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        return s.trim().parse().ok();
    }
    v.as_i64().or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

/// Serde `deserialize_with` for a `u64` that may be quoted.
pub fn deserialize_u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    parse_str_u64(Some(&v)).ok_or_else(|| de::Error::custom(format!("expected unsigned integer, got {v}")))
}

/// Serde `deserialize_with` for an `i64` that may be quoted.
pub fn deserialize_i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    parse_str_i64(Some(&v)).ok_or_else(|| de::Error::custom(format!("expected integer, got {v}")))
}
