//! The authenticated identity used to build the login handshake.
//!
//! A [`Principal`] is obtained out of band (REST user-principals endpoint or
//! a saved JSON document) and handed to each session explicitly. Field names
//! follow the vendor's camelCase JSON; only the fields the streaming session
//! needs are modelled, everything else in the document is ignored.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Result, TdsError};

/// `chrono` format of `streamerInfo.tokenTimestamp`, e.g. `2020-05-22T02:12:48+0000`.
pub const TOKEN_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// User principal document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub primary_account_id: String,
    pub streamer_info: StreamerInfo,
    #[serde(default)]
    pub accounts: Vec<PrincipalAccount>,
}

/// Streamer connection and credential attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerInfo {
    /// Socket endpoint host, e.g. `streamer-ws.tdameritrade.com`.
    pub streamer_socket_url: String,
    pub token: String,
    /// When the streamer token was issued.
    #[serde(serialize_with = "serialize_token_ts", deserialize_with = "deserialize_token_ts")]
    pub token_timestamp: DateTime<FixedOffset>,
    pub user_group: String,
    pub access_level: String,
    pub acl: String,
    pub app_id: String,
}

/// One brokerage account attached to the principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalAccount {
    pub account_id: String,
    pub company: String,
    pub segment: String,
    pub account_cd_domain_id: String,
    #[serde(default)]
    pub acl: String,
}

impl Principal {
    /// The account every session command is issued under.
    ///
    /// This is the first account in the document.
    pub fn session_account(&self) -> Result<&PrincipalAccount> {
        self.accounts
            .first()
            .ok_or_else(|| TdsError::Principal("principal has no accounts".into()))
    }

    /// Check that the principal carries everything the login handshake needs.
    pub fn validate(&self) -> Result<()> {
        self.session_account()?;
        if self.streamer_info.token.is_empty() {
            return Err(TdsError::Principal("streamer token is empty".into()));
        }
        if self.streamer_info.streamer_socket_url.is_empty() {
            return Err(TdsError::Principal("streamer socket url is empty".into()));
        }
        Ok(())
    }
}

fn deserialize_token_ts<'de, D>(deserializer: D) -> std::result::Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_str(&s, TOKEN_TIMESTAMP_FORMAT)
        .map_err(|e| de::Error::custom(format!("bad tokenTimestamp '{s}': {e}")))
}

fn serialize_token_ts<S>(ts: &DateTime<FixedOffset>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.format(TOKEN_TIMESTAMP_FORMAT).to_string())
}
