//! Enumerations used throughout the streamer client.
//!
//! [`Service`] and [`Command`] travel as upper-case strings on the wire. Both
//! keep an `Other` variant so that a service or verb this client does not know
//! about still decodes instead of failing the whole frame.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// A named channel within the streaming protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Service {
    /// Administrative channel: LOGIN, LOGOUT, QOS.
    Admin,
    /// Level-one equity quotes.
    Quote,
    /// Level-one option quotes.
    Option,
    LevelOneFutures,
    LevelOneForex,
    LevelOneFuturesOptions,
    ChartEquity,
    ChartFutures,
    TimesaleEquity,
    TimesaleFutures,
    NewsHeadline,
    AcctActivity,
    /// Any service name not listed above, kept verbatim.
    Other(String),
}

impl Service {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Admin => "ADMIN",
            Self::Quote => "QUOTE",
            Self::Option => "OPTION",
            Self::LevelOneFutures => "LEVELONE_FUTURES",
            Self::LevelOneForex => "LEVELONE_FOREX",
            Self::LevelOneFuturesOptions => "LEVELONE_FUTURES_OPTIONS",
            Self::ChartEquity => "CHART_EQUITY",
            Self::ChartFutures => "CHART_FUTURES",
            Self::TimesaleEquity => "TIMESALE_EQUITY",
            Self::TimesaleFutures => "TIMESALE_FUTURES",
            Self::NewsHeadline => "NEWS_HEADLINE",
            Self::AcctActivity => "ACCT_ACTIVITY",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for Service {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Self::Admin,
            "QUOTE" => Self::Quote,
            "OPTION" => Self::Option,
            "LEVELONE_FUTURES" => Self::LevelOneFutures,
            "LEVELONE_FOREX" => Self::LevelOneForex,
            "LEVELONE_FUTURES_OPTIONS" => Self::LevelOneFuturesOptions,
            "CHART_EQUITY" => Self::ChartEquity,
            "CHART_FUTURES" => Self::ChartFutures,
            "TIMESALE_EQUITY" => Self::TimesaleEquity,
            "TIMESALE_FUTURES" => Self::TimesaleFutures,
            "NEWS_HEADLINE" => Self::NewsHeadline,
            "ACCT_ACTIVITY" => Self::AcctActivity,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Service {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Service> for String {
    fn from(s: Service) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Command verbs
// ---------------------------------------------------------------------------

/// Command verb carried by requests, responses, and data units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Login,
    Logout,
    Qos,
    Subs,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Qos => "QOS",
            Self::Subs => "SUBS",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LOGIN" => Self::Login,
            "LOGOUT" => Self::Logout,
            "QOS" => Self::Qos,
            "SUBS" => Self::Subs,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Command {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Command> for String {
    fn from(c: Command) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------------

/// Server-side minimum interval between successive push updates.
///
/// The discriminant is the value sent as the `qoslevel` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QosLevel {
    Express = 0,
    RealTime = 1,
    Fast = 2,
    Moderate = 3,
    Slow = 4,
    Delayed = 5,
}

impl QosLevel {
    /// Wire value for the `qoslevel` parameter.
    #[inline]
    pub fn wire_value(self) -> u8 {
        self as u8
    }

    /// Documented update interval for this level.
    pub fn interval(self) -> Duration {
        let ms = match self {
            Self::Express => 500,
            Self::RealTime => 750,
            Self::Fast => 1000,
            Self::Moderate => 1500,
            Self::Slow | Self::Delayed => 3000,
        };
        Duration::from_millis(ms)
    }
}

impl FromStr for QosLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "express" => Ok(Self::Express),
            "1" | "real_time" | "realtime" => Ok(Self::RealTime),
            "2" | "fast" => Ok(Self::Fast),
            "3" | "moderate" => Ok(Self::Moderate),
            "4" | "slow" => Ok(Self::Slow),
            "5" | "delayed" => Ok(Self::Delayed),
            other => Err(format!("unknown QoS level: {other}")),
        }
    }
}
