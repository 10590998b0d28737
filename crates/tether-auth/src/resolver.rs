use crate::identity::Identity;
use crate::secret::{derive_user_id, secrets_match};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tracing::{debug, info, warn};

/// Auth configuration for the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// When false, connections are admitted without any credential.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Request header the credential is read from.
    #[serde(default = "default_header")]
    pub header: String,
    /// Single static API key.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Delegate verification endpoint; takes precedence over `api_key`.
    #[serde(default)]
    pub delegate_url: Option<String>,
    /// Timeout for one delegate lookup.
    #[serde(default = "default_delegate_timeout")]
    pub delegate_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_header() -> String {
    "x-api-key".to_string()
}
fn default_delegate_timeout() -> u64 {
    10
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_header(),
            api_key: None,
            delegate_url: None,
            delegate_timeout_secs: default_delegate_timeout(),
        }
    }
}

impl AuthConfig {
    /// Select the resolution strategy. Empty strings count as unset.
    pub fn mode(&self) -> AuthMode {
        if !self.enabled {
            return AuthMode::Disabled;
        }
        if let Some(url) = non_empty(&self.delegate_url) {
            return AuthMode::Delegate {
                url: url.to_string(),
            };
        }
        if let Some(key) = non_empty(&self.api_key) {
            return AuthMode::StaticKey(key.to_string());
        }
        AuthMode::Permissive
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// How credentials are resolved.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// No credential is required; sessions carry no identity.
    Disabled,
    /// A remote service validates each key.
    Delegate {
        /// Verification endpoint, queried as `GET <url>?apiKey=<key>`.
        url: String,
    },
    /// One configured key, compared in constant time.
    StaticKey(String),
    /// Any non-empty key is accepted.
    Permissive,
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Disabled => f.write_str("Disabled"),
            AuthMode::Delegate { url } => f.debug_struct("Delegate").field("url", url).finish(),
            AuthMode::StaticKey(_) => f.write_str("StaticKey(<redacted>)"),
            AuthMode::Permissive => f.write_str("Permissive"),
        }
    }
}

/// Resolves a presented credential to an identity.
///
/// Implementations never fail across this boundary: anything other than a
/// positive answer is `None`.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Whether connections must present a credential at all.
    fn is_required(&self) -> bool {
        true
    }

    /// Resolve a non-empty credential.
    async fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// Body returned by the delegate verification endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateResponse {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// The bridge's credential resolver.
pub struct AuthResolver {
    mode: AuthMode,
    http: reqwest::Client,
}

impl AuthResolver {
    /// Build a resolver from config.
    pub fn new(config: &AuthConfig) -> TetherResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delegate_timeout_secs.max(1)))
            .build()
            .map_err(|e| TetherError::Config(format!("Failed to build HTTP client: {e}")))?;

        let mode = config.mode();
        match &mode {
            AuthMode::Disabled => warn!("Authentication disabled: every connection is admitted"),
            AuthMode::Delegate { url } => info!(url = %url, "Delegate key verification enabled"),
            AuthMode::StaticKey(_) => info!("Static API key auth enabled"),
            AuthMode::Permissive => warn!(
                "No API key or delegate configured: any non-empty key will be accepted"
            ),
        }

        Ok(Self { mode, http })
    }

    /// The selected strategy.
    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    async fn verify_with_delegate(&self, url: &str, credential: &str) -> TetherResult<Option<Identity>> {
        let response = self
            .http
            .get(url)
            .query(&[("apiKey", credential)])
            .send()
            .await
            .map_err(|e| TetherError::DelegateUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = %status, "Delegate rejected key");
            return Ok(None);
        }

        let body: DelegateResponse = response
            .json()
            .await
            .map_err(|e| TetherError::DelegateUnreachable(format!("invalid delegate body: {e}")))?;

        if !body.valid {
            return Ok(None);
        }

        let user_id = body
            .user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_user_id(credential));

        Ok(Some(Identity {
            user_id,
            permissions: body.permissions,
            env: body.env,
            api_key: Some(credential.to_string()),
        }))
    }
}

#[async_trait]
impl CredentialResolver for AuthResolver {
    fn is_required(&self) -> bool {
        self.mode != AuthMode::Disabled
    }

    async fn resolve(&self, credential: &str) -> Option<Identity> {
        if credential.is_empty() {
            return None;
        }

        match &self.mode {
            AuthMode::Disabled => None,
            AuthMode::Delegate { url } => match self.verify_with_delegate(url, credential).await {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(error = %e, "Delegate verification failed, rejecting key");
                    None
                }
            },
            AuthMode::StaticKey(expected) => secrets_match(expected, credential)
                .then(|| Identity::new(derive_user_id(credential)).with_api_key(credential)),
            AuthMode::Permissive => {
                Some(Identity::new(derive_user_id(credential)).with_api_key(credential))
            }
        }
    }
}
