use crate::bridge::{message_event, relay, SessionLink};
use crate::factory::{SessionFactory, SessionRequest, SessionUpstream};
use crate::middleware::{
    cors_middleware, extra_headers_middleware, extract_credential, ExtraHeaders,
    CREDENTIAL_QUERY_PARAM,
};
use crate::observer::{CloseReason, LoggingObserver, SessionObserver};
use crate::session::{PendingSession, SessionInfo, SessionRegistry};
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware as axum_mw,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tether_auth::CredentialResolver;
use tether_core::{JsonRpcMessage, TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Method of the notification sent on every new push stream.
pub const CONNECTION_ESTABLISHED: &str = "notifications/connection_established";

/// Listener settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Path of the push-stream endpoint.
    pub sse_path: String,
    /// Path clients post messages to.
    pub message_path: String,
    /// Prefix for the announced message endpoint, e.g. `https://host`.
    pub base_url: String,
    /// Header the credential is read from.
    pub auth_header: String,
    /// Extra `name: value` headers added to every response.
    pub headers: Vec<(String, String)>,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sse_path: "/sse".into(),
            message_path: "/messages".into(),
            base_url: String::new(),
            auth_header: "x-api-key".into(),
            headers: Vec::new(),
            keep_alive_secs: 15,
        }
    }
}

impl GatewayConfig {
    /// Check paths and header names before they reach the router.
    pub fn validate(&self) -> TetherResult<()> {
        for (name, path) in [("sse_path", &self.sse_path), ("message_path", &self.message_path)] {
            if !path.starts_with('/') {
                return Err(TetherError::Config(format!("{name} must start with '/': {path}")));
            }
            if path == "/ping" || path == "/health" {
                return Err(TetherError::Config(format!("{name} collides with {path}")));
            }
        }
        if self.sse_path == self.message_path {
            return Err(TetherError::Config(
                "sse_path and message_path must differ".into(),
            ));
        }
        HeaderName::from_bytes(self.auth_header.as_bytes())
            .map_err(|_| TetherError::Config(format!("invalid auth header: {}", self.auth_header)))?;
        self.extra_headers()?;
        Ok(())
    }

    /// Parsed custom response headers.
    pub fn extra_headers(&self) -> TetherResult<ExtraHeaders> {
        self.headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|_| TetherError::Config(format!("invalid header name: {name}")))?;
                let value = HeaderValue::from_str(value.trim())
                    .map_err(|_| TetherError::Config(format!("invalid value for header {name}")))?;
                Ok((name, value))
            })
            .collect::<TetherResult<Vec<_>>>()
            .map(ExtraHeaders)
    }

    fn endpoint_for(&self, session_id: Uuid) -> String {
        format!(
            "{}{}?sessionId={}",
            self.base_url.trim_end_matches('/'),
            self.message_path,
            session_id
        )
    }
}

/// Error surfaced to an HTTP caller as a plain-text response.
#[derive(Debug)]
pub struct ApiError(pub TetherError);

impl From<TetherError> for ApiError {
    fn from(e: TetherError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TetherError::Admission(_) | TetherError::DelegateUnreachable(_) => {
                StatusCode::UNAUTHORIZED
            }
            TetherError::Routing(_) | TetherError::Protocol(_) | TetherError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            TetherError::Bridge(_) => StatusCode::SERVICE_UNAVAILABLE,
            TetherError::Construction(_)
            | TetherError::Upstream(_)
            | TetherError::Config(_)
            | TetherError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// Shared application state.
struct GatewayState {
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn CredentialResolver>,
    factory: Arc<dyn SessionFactory>,
    observers: Vec<Arc<dyn SessionObserver>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GatewayState {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Control surface over a built gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    registry: Arc<SessionRegistry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GatewayHandle {
    /// The live session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Refuse new connections, close every session and wait until the
    /// registry is empty. Callers bound this with a timeout.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let sessions = self.registry.len().await;
        info!(sessions, "Closing all sessions");
        self.registry.wait_until_empty().await;
    }
}

/// The SSE gateway.
pub struct GatewayServer {
    config: GatewayConfig,
    resolver: Arc<dyn CredentialResolver>,
    factory: Arc<dyn SessionFactory>,
    observers: Vec<Arc<dyn SessionObserver>>,
    fallback: Option<Router>,
}

impl GatewayServer {
    /// Gateway with the default logging observer.
    pub fn new(
        config: GatewayConfig,
        resolver: Arc<dyn CredentialResolver>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            resolver,
            factory,
            observers: vec![Arc::new(LoggingObserver)],
            fallback: None,
        }
    }

    /// Add a lifecycle observer.
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Serve unmatched routes from `router` instead of answering 404.
    pub fn with_fallback(mut self, router: Router) -> Self {
        self.fallback = Some(router);
        self
    }

    /// Build the router and its control handle.
    pub fn build(self) -> TetherResult<(Router, GatewayHandle)> {
        self.config.validate()?;
        let extra = Arc::new(self.config.extra_headers()?);

        let registry = SessionRegistry::new();
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let handle = GatewayHandle {
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        };

        let sse_path = self.config.sse_path.clone();
        let message_path = self.config.message_path.clone();
        let state = Arc::new(GatewayState {
            config: self.config,
            registry,
            resolver: self.resolver,
            factory: self.factory,
            observers: self.observers,
            shutdown,
        });

        let app = Router::new()
            .route(&sse_path, get(sse_handler))
            .route(&message_path, post(message_handler))
            .route("/ping", get(ping_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        // A known path hit with the wrong method also belongs to the host
        // router when one is supplied; otherwise axum answers 405.
        let app = match self.fallback {
            Some(fallback) => {
                let host = fallback.clone();
                app.method_not_allowed_fallback(move |request: Request| {
                    let host = host.clone();
                    async move {
                        match host.oneshot(request).await {
                            Ok(response) => response,
                            Err(never) => match never {},
                        }
                    }
                })
                .fallback_service(fallback)
            }
            None => app.fallback(not_found_handler),
        };

        let app = app
            .layer(axum_mw::from_fn(cors_middleware))
            .layer(axum_mw::from_fn_with_state(extra, extra_headers_middleware));

        Ok((app, handle))
    }
}

async fn ping_handler() -> &'static str {
    "pong"
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let status = if state.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(serde_json::json!({
        "status": status,
        "service": "tether",
        "sessions": state.registry.len().await,
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

#[derive(Debug, Default, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Push stream handed to the client. Dropping it (the client went away)
/// drops the disconnect sender, which ends the session's relay loop.
struct PushStream {
    events: UnboundedReceiverStream<Event>,
    _disconnect: oneshot::Sender<()>,
}

impl Stream for PushStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx).map(|e| e.map(Ok))
    }
}

async fn sse_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<Vec<(String, String)>>,
    request: Request,
) -> Result<Sse<KeepAliveStream<PushStream>>, ApiError> {
    if state.is_shutting_down() {
        return Err(TetherError::Bridge("server is shutting down".into()).into());
    }

    let headers = request.headers().clone();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let identity = if state.resolver.is_required() {
        // Repeated parameters are tolerated; the first non-blank key is used.
        let query_key = query
            .iter()
            .find(|(name, value)| name == CREDENTIAL_QUERY_PARAM && !value.trim().is_empty())
            .map(|(_, value)| value.as_str());
        let Some(credential) = extract_credential(&headers, &state.config.auth_header, query_key)
        else {
            warn!(remote = ?remote, "Rejected connection: missing credential");
            return Err(TetherError::Admission("Missing credential".into()).into());
        };
        let Some(identity) = state.resolver.resolve(&credential).await else {
            warn!(remote = ?remote, "Rejected connection: invalid credential");
            return Err(TetherError::Admission("Invalid credential".into()).into());
        };
        Some(identity)
    } else {
        None
    };

    // Setup runs detached so a client that hangs up mid-setup still leaves a
    // consistent registry behind.
    let keep_alive = KeepAlive::new().interval(Duration::from_secs(state.config.keep_alive_secs.max(1)));
    let stream = tokio::spawn(open_session(state, identity, headers, remote))
        .await
        .map_err(|e| TetherError::Bridge(format!("session setup aborted: {e}")))??;

    Ok(Sse::new(stream).keep_alive(keep_alive))
}

async fn open_session(
    state: Arc<GatewayState>,
    identity: Option<tether_auth::Identity>,
    headers: axum::http::HeaderMap,
    remote: Option<SocketAddr>,
) -> Result<PushStream, TetherError> {
    let pending = PendingSession::register(&state.registry, identity.clone()).await;
    let session_id = pending.id();
    let user_id = identity.as_ref().map(|i| i.user_id.clone());

    let session_request = SessionRequest {
        session_id,
        user_id: user_id.clone(),
        env: identity.map(|i| i.env).unwrap_or_default(),
        headers,
        remote,
    };

    let upstream = match state.factory.create(&session_request).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Session construction failed");
            pending.abandon().await;
            return Err(match e {
                TetherError::Construction(_) => e,
                other => TetherError::Construction(other.to_string()),
            });
        }
    };

    let deliveries = match upstream.mux.attach(session_id).await {
        Ok(rx) => rx,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to attach session upstream");
            release_upstream(&upstream, session_id).await;
            pending.abandon().await;
            return Err(TetherError::Construction(e.to_string()));
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let endpoint = state.config.endpoint_for(session_id);
    let _ = outbound_tx.send(Event::default().event("endpoint").data(endpoint));
    let established = JsonRpcMessage::notification(
        CONNECTION_ESTABLISHED,
        serde_json::json!({ "sessionId": session_id, "userId": user_id }),
    );
    if let Some(event) = message_event(&established) {
        let _ = outbound_tx.send(event);
    }

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let Some(info) = pending.activate(inbound_tx).await else {
        upstream.mux.detach(session_id).await;
        release_upstream(&upstream, session_id).await;
        return Err(TetherError::Bridge("session closed during setup".into()));
    };

    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let link = SessionLink {
        session_id,
        inbound: inbound_rx,
        deliveries,
        outbound: outbound_tx,
        disconnected: disconnect_rx,
        shutdown: state.shutdown.subscribe(),
    };
    tokio::spawn(run_session(state, info, link, upstream));

    Ok(PushStream {
        events: UnboundedReceiverStream::new(outbound_rx),
        _disconnect: disconnect_tx,
    })
}

async fn run_session(
    state: Arc<GatewayState>,
    info: SessionInfo,
    link: SessionLink,
    upstream: SessionUpstream,
) {
    for observer in &state.observers {
        observer.on_connect(&info).await;
    }
    let reason = relay(link, &upstream.mux).await;
    teardown(&state, info.id, &upstream, reason).await;
}

/// Close a session exactly once: detach, release its upstream, remove it.
async fn teardown(
    state: &GatewayState,
    session_id: Uuid,
    upstream: &SessionUpstream,
    reason: CloseReason,
) {
    if state.registry.begin_close(session_id).await.is_none() {
        return;
    }
    let discarded = upstream.mux.detach(session_id).await;
    if discarded > 0 {
        debug!(session_id = %session_id, discarded, "Discarded pending requests");
    }
    release_upstream(upstream, session_id).await;

    if let Some(info) = state.registry.remove(session_id).await {
        for observer in &state.observers {
            observer.on_close(&info, &reason).await;
        }
    }
}

async fn release_upstream(upstream: &SessionUpstream, session_id: Uuid) {
    if !upstream.dedicated {
        return;
    }
    if let Err(e) = upstream.mux.close().await {
        warn!(session_id = %session_id, upstream = %upstream.mux.name(), error = %e, "Failed to close session upstream");
    }
}

async fn message_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let raw_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TetherError::Routing("Missing sessionId parameter".into()))?;
    let session_id = Uuid::parse_str(&raw_id)
        .map_err(|_| TetherError::Routing(format!("Invalid sessionId: {raw_id}")))?;
    let inbound = state
        .registry
        .inbound(session_id)
        .await
        .ok_or_else(|| TetherError::Routing(format!("No active session: {session_id}")))?;

    let message = JsonRpcMessage::parse(&body).map_err(|e| match e {
        TetherError::Json(e) => TetherError::Protocol(format!("invalid JSON: {e}")),
        other => other,
    })?;
    debug!(session_id = %session_id, kind = ?message.kind(), method = message.method().unwrap_or_default(), "Message received");

    inbound
        .send(message)
        .map_err(|_| TetherError::Routing(format!("Session is closing: {session_id}")))?;
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let relative = GatewayConfig {
            sse_path: "sse".into(),
            ..GatewayConfig::default()
        };
        assert!(relative.validate().is_err());

        let same = GatewayConfig {
            message_path: "/sse".into(),
            ..GatewayConfig::default()
        };
        assert!(same.validate().is_err());

        let shadowed = GatewayConfig {
            message_path: "/ping".into(),
            ..GatewayConfig::default()
        };
        assert!(shadowed.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_headers() {
        let config = GatewayConfig {
            headers: vec![("bad header".into(), "v".into())],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            auth_header: "not a header".into(),
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_uses_base_url() {
        let id = Uuid::new_v4();
        let config = GatewayConfig {
            base_url: "https://bridge.example/".into(),
            ..GatewayConfig::default()
        };
        assert_eq!(
            config.endpoint_for(id),
            format!("https://bridge.example/messages?sessionId={id}")
        );
        assert_eq!(
            GatewayConfig::default().endpoint_for(id),
            format!("/messages?sessionId={id}")
        );
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: TetherError| ApiError(e).into_response().status();
        assert_eq!(status(TetherError::Admission("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status(TetherError::Routing("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(TetherError::Protocol("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(TetherError::Construction("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(TetherError::Bridge("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
