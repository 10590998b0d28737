use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// The identity an admitted session runs as.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Caller id, from the delegate or derived from the key.
    pub user_id: String,
    /// Permission names granted by the delegate.
    pub permissions: Vec<String>,
    /// Environment variables to hand the session's upstream worker.
    pub env: HashMap<String, String>,
    /// The credential that admitted this session. Session-scoped, never re-validated.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Identity {
    /// Identity with only a user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Attach the admitting credential.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Whether the identity carries environment variables for its worker.
    pub fn has_env(&self) -> bool {
        !self.env.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("permissions", &self.permissions)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
