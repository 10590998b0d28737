use crate::session::SessionInfo;
use async_trait::async_trait;
use std::fmt;
use tracing::info;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the push stream.
    RemoteDisconnected,
    /// The upstream channel ended.
    UpstreamClosed(String),
    /// Relaying failed.
    BridgeFailure(String),
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteDisconnected => f.write_str("remote disconnected"),
            CloseReason::UpstreamClosed(reason) => write!(f, "upstream closed: {reason}"),
            CloseReason::BridgeFailure(reason) => write!(f, "bridge failure: {reason}"),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Lifecycle hooks for sessions.
///
/// `on_connect` fires once a session is active; `on_close` fires exactly once
/// after it has been removed from the registry.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// A session became active.
    async fn on_connect(&self, _session: &SessionInfo) {}

    /// A session was torn down.
    async fn on_close(&self, _session: &SessionInfo, _reason: &CloseReason) {}
}

/// Observer that logs session lifecycle events.
pub struct LoggingObserver;

#[async_trait]
impl SessionObserver for LoggingObserver {
    async fn on_connect(&self, session: &SessionInfo) {
        info!(session_id = %session.id, user_id = ?session.user_id, "Client connected");
    }

    async fn on_close(&self, session: &SessionInfo, reason: &CloseReason) {
        let duration_ms = (chrono::Utc::now() - session.created_at).num_milliseconds();
        info!(
            session_id = %session.id,
            user_id = ?session.user_id,
            reason = %reason,
            duration_ms,
            "Client disconnected"
        );
    }
}
