//! Configuration parsing for the streamer client.
//!
//! The runner reads a single JSON config file. The top-level structure holds
//! logging metadata, where to obtain the [`Principal`](crate::Principal), the
//! session tuning block, and the list of subscriptions to register.
//!
//! # Example config
//!
//! ```json
//! {
//!   "module": { "module_name": "tds_stream", "log_path": "/tmp/log" },
//!   "principal": { "file": "principal.json" },
//!   "stream": { "qos": "fast", "request_timeout_ms": 10000 },
//!   "subscriptions": [
//!     { "service": "QUOTE", "subscriber": "runner", "symbols": ["SPY", "QQQ"] }
//!   ]
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::types::{QosLevel, Service};

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    pub module: Option<ModuleMeta>,

    /// Where the session principal comes from.
    pub principal: PrincipalSource,

    /// Session tuning.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Subscriptions registered once the session is ready.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl AppConfig {
    /// Returns the module name, defaulting to `"tds_stream"`.
    pub fn module_name(&self) -> String {
        self.module.as_ref().and_then(|m| m.module_name.clone()).unwrap_or_else(|| "tds_stream".to_string())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.module.as_ref().and_then(|m| m.log_path.clone())
    }
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Source of the user principal.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalSource {
    /// A saved user-principals JSON document.
    File(PathBuf),
    /// The vendor's REST user-principals endpoint.
    Rest(RestPrincipalConfig),
}

/// REST principal endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestPrincipalConfig {
    /// API base URL (e.g. `https://api.tdameritrade.com`).
    #[serde(default = "default_rest_base_url")]
    pub base_url: String,

    /// Environment variable holding the bearer access token.
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
}

/// Streaming session settings. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// QoS level requested right after login. `None` leaves the server default.
    pub qos: Option<QosLevel>,

    /// Expire in-flight requests after this many milliseconds. `None` disables
    /// expiry.
    pub request_timeout_ms: Option<u64>,

    /// How often the dispatcher sweeps for expired requests.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Protocol version sent with LOGIN.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// `ws` or `wss`.
    #[serde(default = "default_socket_scheme")]
    pub socket_scheme: String,

    /// Path appended to the principal's socket host.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl StreamConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Full socket URL for a given host, e.g. `wss://host/ws`.
    pub fn socket_url(&self, host: &str) -> String {
        format!("{}://{}{}", self.socket_scheme, host, self.socket_path)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            qos: None,
            request_timeout_ms: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            protocol_version: default_protocol_version(),
            socket_scheme: default_socket_scheme(),
            socket_path: default_socket_path(),
        }
    }
}

/// One configured subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub service: Service,
    pub subscriber: String,
    pub symbols: Vec<String>,
}

fn default_rest_base_url() -> String {
    "https://api.tdameritrade.com".to_string()
}
fn default_access_token_env() -> String {
    "TDS_ACCESS_TOKEN".to_string()
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_protocol_version() -> String {
    "1.0".to_string()
}
fn default_socket_scheme() -> String {
    "wss".to_string()
}
fn default_socket_path() -> String {
    "/ws".to_string()
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&content).context("parsing config JSON")?;
    Ok(config)
}
