//! Sources for the user principal a session logs in with.

use std::path::PathBuf;

use async_trait::async_trait;
use tds_core::error::{Result, TdsError};
use tds_core::Principal;
use tracing::{debug, info};

/// Fields requested from the principal endpoint.
const PRINCIPAL_FIELDS: &str = "streamerSubscriptionKeys,streamerConnectionInfo";

/// Something that can produce a validated [`Principal`].
#[async_trait]
pub trait PrincipalProvider: Send + Sync {
    async fn principal(&self) -> Result<Principal>;
}

/// Principal stored as JSON on disk.
pub struct FilePrincipalProvider {
    path: PathBuf,
}

impl FilePrincipalProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PrincipalProvider for FilePrincipalProvider {
    async fn principal(&self) -> Result<Principal> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| TdsError::Principal(format!("read {}: {e}", self.path.display())))?;
        let principal: Principal = serde_json::from_str(&raw)
            .map_err(|e| TdsError::Principal(format!("parse {}: {e}", self.path.display())))?;
        principal.validate()?;
        debug!("[principal] loaded {} from {}", principal.user_id, self.path.display());
        Ok(principal)
    }
}

/// Principal fetched from `GET {base_url}/v1/userprincipals` with a bearer token.
pub struct RestPrincipalProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl RestPrincipalProvider {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl PrincipalProvider for RestPrincipalProvider {
    async fn principal(&self) -> Result<Principal> {
        let url = format!("{}/v1/userprincipals", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("fields", PRINCIPAL_FIELDS)])
            .send()
            .await
            .map_err(|e| TdsError::Principal(format!("request {url}: {e}")))?
            .error_for_status()
            .map_err(|e| TdsError::Principal(format!("{url}: {e}")))?;

        let principal: Principal = resp
            .json()
            .await
            .map_err(|e| TdsError::Principal(format!("decode {url}: {e}")))?;
        principal.validate()?;
        info!(
            "[principal] fetched {} (socket host {})",
            principal.user_id, principal.streamer_info.streamer_socket_url
        );
        Ok(principal)
    }
}
