use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tether_auth::Identity;
use tether_core::JsonRpcMessage;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, upstream not yet attached.
    Authenticating,
    /// Relaying traffic.
    Active,
    /// Teardown in progress.
    Closing,
    /// Removed from the registry.
    Closed,
}

/// Snapshot of a session, handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id, also the `sessionId` query parameter.
    pub id: Uuid,
    /// Resolved caller, absent when auth is disabled.
    pub user_id: Option<String>,
    /// State at the time of the snapshot.
    pub state: SessionState,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

struct SessionEntry {
    info: SessionInfo,
    identity: Option<Identity>,
    inbound: Option<mpsc::UnboundedSender<JsonRpcMessage>>,
}

/// Owns every live session.
///
/// Only `Active` sessions are visible to message routing, so a session under
/// construction or in teardown never receives posted messages.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    emptied: Notify,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session in `Authenticating` state under a fresh id.
    pub async fn register(&self, identity: Option<Identity>) -> SessionInfo {
        let mut sessions = self.sessions.write().await;
        let mut id = Uuid::new_v4();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4();
        }

        let info = SessionInfo {
            id,
            user_id: identity.as_ref().map(|i| i.user_id.clone()),
            state: SessionState::Authenticating,
            created_at: Utc::now(),
        };
        sessions.insert(
            id,
            SessionEntry {
                info: info.clone(),
                identity,
                inbound: None,
            },
        );
        debug!(session_id = %id, "Session registered");
        info
    }

    /// Move an `Authenticating` session to `Active` and install its inbound queue.
    pub async fn activate(
        &self,
        id: Uuid,
        inbound: mpsc::UnboundedSender<JsonRpcMessage>,
    ) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id)?;
        if entry.info.state != SessionState::Authenticating {
            return None;
        }
        entry.info.state = SessionState::Active;
        entry.inbound = Some(inbound);
        info!(session_id = %id, user_id = ?entry.info.user_id, "Session active");
        Some(entry.info.clone())
    }

    /// Mark a session `Closing`. Returns `None` if it is gone or already closing,
    /// which makes this the one-shot gate for teardown.
    pub async fn begin_close(&self, id: Uuid) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id)?;
        match entry.info.state {
            SessionState::Authenticating | SessionState::Active => {
                entry.info.state = SessionState::Closing;
                entry.inbound = None;
                Some(entry.info.clone())
            }
            SessionState::Closing | SessionState::Closed => None,
        }
    }

    /// Remove a session. The returned snapshot is in `Closed` state.
    pub async fn remove(&self, id: Uuid) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let mut entry = sessions.remove(&id)?;
        entry.info.state = SessionState::Closed;
        info!(session_id = %id, remaining = sessions.len(), "Session removed");
        if sessions.is_empty() {
            self.emptied.notify_waiters();
        }
        Some(entry.info)
    }

    /// Inbound queue of an `Active` session.
    pub async fn inbound(&self, id: Uuid) -> Option<mpsc::UnboundedSender<JsonRpcMessage>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&id)
            .filter(|entry| entry.info.state == SessionState::Active)
            .and_then(|entry| entry.inbound.clone())
    }

    /// Current state of a session.
    pub async fn state(&self, id: Uuid) -> Option<SessionState> {
        self.sessions.read().await.get(&id).map(|e| e.info.state)
    }

    /// Identity a session was admitted with.
    pub async fn identity(&self, id: Uuid) -> Option<Identity> {
        self.sessions
            .read()
            .await
            .get(&id)
            .and_then(|e| e.identity.clone())
    }

    /// Number of registered sessions, in any state.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshots of all registered sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Resolve once no session is registered.
    pub async fn wait_until_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.is_empty().await {
                return;
            }
            emptied.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            emptied: Notify::new(),
        }
    }
}

/// A registration that is rolled back unless it is activated.
///
/// Dropping it before [`PendingSession::activate`] (for example because the
/// client went away while the upstream was being constructed) removes the
/// half-built session.
pub(crate) struct PendingSession {
    registry: Arc<SessionRegistry>,
    id: Uuid,
    committed: bool,
}

impl PendingSession {
    pub(crate) async fn register(registry: &Arc<SessionRegistry>, identity: Option<Identity>) -> Self {
        let info = registry.register(identity).await;
        Self {
            registry: registry.clone(),
            id: info.id,
            committed: false,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) async fn activate(
        mut self,
        inbound: mpsc::UnboundedSender<JsonRpcMessage>,
    ) -> Option<SessionInfo> {
        let info = self.registry.activate(self.id, inbound).await;
        self.committed = info.is_some();
        info
    }

    pub(crate) async fn abandon(mut self) {
        self.committed = true;
        self.registry.remove(self.id).await;
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let registry = self.registry.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.remove(id).await;
            });
        }
    }
}
