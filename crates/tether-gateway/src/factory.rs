//! Per-session upstream construction.
//!
//! A shared worker cannot give each session its own environment without
//! leaking it to every other session, so environment injection is only
//! honoured by [`PerSessionWorkerFactory`], which passes the caller's
//! variables to a dedicated child process at spawn time.

use crate::bridge::Multiplexer;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::{TetherError, TetherResult};
use tether_upstream::{StdioUpstream, UpstreamConfig};
use tracing::{info, warn};
use uuid::Uuid;

/// What the listener knows about a connection when it asks for an upstream.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Id of the session being constructed.
    pub session_id: Uuid,
    /// Resolved caller, absent when auth is disabled.
    pub user_id: Option<String>,
    /// Environment supplied by the auth resolver.
    pub env: HashMap<String, String>,
    /// Headers of the connect request.
    pub headers: HeaderMap,
    /// Peer address, when the listener records it.
    pub remote: Option<SocketAddr>,
}

/// The upstream a session is bridged to.
#[derive(Clone)]
pub struct SessionUpstream {
    /// Multiplexer over the session's upstream channel.
    pub mux: Arc<Multiplexer>,
    /// Whether the upstream belongs to this session alone and must be closed with it.
    pub dedicated: bool,
}

/// Builds the upstream side of a new session.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Construct the session's upstream. Errors become a 500 on connect.
    async fn create(&self, request: &SessionRequest) -> TetherResult<SessionUpstream>;
}

/// Hands every session the same long-lived worker.
pub struct SharedWorkerFactory {
    mux: Arc<Multiplexer>,
}

impl SharedWorkerFactory {
    /// Use an already running multiplexer.
    pub fn new(mux: Arc<Multiplexer>) -> Self {
        Self { mux }
    }

    /// Spawn the shared stdio worker.
    pub fn spawn(config: &UpstreamConfig) -> TetherResult<Self> {
        let (upstream, events) = StdioUpstream::spawn(config, &HashMap::new())?;
        Ok(Self::new(Multiplexer::start(Arc::new(upstream), events)))
    }

    /// The shared multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }
}

#[async_trait]
impl SessionFactory for SharedWorkerFactory {
    async fn create(&self, request: &SessionRequest) -> TetherResult<SessionUpstream> {
        if self.mux.is_closed().await {
            return Err(TetherError::Construction(
                "shared worker is not running".into(),
            ));
        }
        if !request.env.is_empty() {
            warn!(
                session_id = %request.session_id,
                keys = ?request.env.keys().collect::<Vec<_>>(),
                "Per-session environment is not applied to a shared worker; use per-session worker mode"
            );
        }
        Ok(SessionUpstream {
            mux: self.mux.clone(),
            dedicated: false,
        })
    }
}

/// Spawns a dedicated worker for every session.
pub struct PerSessionWorkerFactory {
    config: UpstreamConfig,
}

impl PerSessionWorkerFactory {
    /// Factory spawning `config` once per session.
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for PerSessionWorkerFactory {
    async fn create(&self, request: &SessionRequest) -> TetherResult<SessionUpstream> {
        let (upstream, events) = StdioUpstream::spawn(&self.config, &request.env)
            .map_err(|e| TetherError::Construction(e.to_string()))?;
        info!(
            session_id = %request.session_id,
            user_id = ?request.user_id,
            env_vars = request.env.len(),
            "Spawned dedicated worker"
        );
        Ok(SessionUpstream {
            mux: Multiplexer::start(Arc::new(upstream), events),
            dedicated: true,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tether_upstream::ChannelUpstream;

    fn request(env: &[(&str, &str)]) -> SessionRequest {
        SessionRequest {
            session_id: Uuid::new_v4(),
            user_id: Some("u1".into()),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: HeaderMap::new(),
            remote: None,
        }
    }

    #[tokio::test]
    async fn test_shared_factory_hands_out_same_mux() {
        let (upstream, events, _worker) = ChannelUpstream::pair("shared");
        let factory = SharedWorkerFactory::new(Multiplexer::start(Arc::new(upstream), events));

        let a = factory.create(&request(&[])).await.unwrap();
        let b = factory.create(&request(&[("T", "v1")])).await.unwrap();
        assert!(Arc::ptr_eq(&a.mux, &b.mux));
        assert!(!a.dedicated);
    }

    #[tokio::test]
    async fn test_shared_factory_fails_after_worker_exit() {
        let (upstream, events, worker) = ChannelUpstream::pair("shared");
        let factory = SharedWorkerFactory::new(Multiplexer::start(Arc::new(upstream), events));
        worker.close("gone");

        let mut closed = false;
        for _ in 0..50 {
            if factory.multiplexer().is_closed().await {
                closed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(closed);
        let err = factory.create(&request(&[])).await.err().unwrap();
        assert!(matches!(err, TetherError::Construction(_)));
    }

    #[tokio::test]
    async fn test_per_session_factory_spawn_failure_is_construction_error() {
        let factory = PerSessionWorkerFactory::new(UpstreamConfig {
            command: "/definitely/not/a/real/binary".into(),
            ..UpstreamConfig::default()
        });
        let err = factory.create(&request(&[])).await.err().unwrap();
        assert!(matches!(err, TetherError::Construction(_)));
    }
}
