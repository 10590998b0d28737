//! The message bridge between remote sessions and an upstream worker.
//!
//! # Multiplexing contract
//!
//! One upstream channel may serve many sessions at once, and every session
//! chooses its own request ids. The [`Multiplexer`] therefore never forwards a
//! client request id upstream as-is: each request gets a fresh upstream id, and
//! the `upstream id -> (session, original id)` record is the only way a
//! response finds its way back. A response whose record is missing, or whose
//! owner has detached, is dropped, never broadcast. This table is what keeps
//! two sessions using the same id from seeing each other's responses.

use crate::observer::CloseReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{JsonRpcMessage, MessageKind, RequestId, TetherError, TetherResult};
use tether_upstream::{UpstreamEvent, UpstreamEvents, UpstreamTransport};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// JSON-RPC error code used when a worker request has no session to go to.
const NO_SESSION_ERROR: i64 = -32603;

/// What the multiplexer hands to an attached session.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A message for the session's push channel.
    Message(JsonRpcMessage),
    /// The upstream channel ended; the session must tear down.
    UpstreamClosed {
        /// Cause reported by the upstream.
        reason: String,
    },
}

struct PendingRequest {
    session_id: Uuid,
    original_id: RequestId,
}

#[derive(Default)]
struct MuxState {
    routes: HashMap<Uuid, mpsc::UnboundedSender<Delivery>>,
    attach_order: Vec<Uuid>,
    pending: HashMap<i64, PendingRequest>,
    server_requests: HashMap<RequestId, Uuid>,
    last_active: Option<Uuid>,
    closed: Option<String>,
}

impl MuxState {
    /// Session a worker-initiated request goes to: the last session to talk
    /// upstream, else the most recently attached one.
    fn server_request_target(&self) -> Option<Uuid> {
        self.last_active
            .filter(|id| self.routes.contains_key(id))
            .or_else(|| self.attach_order.last().copied())
    }
}

/// Correlating relay over one upstream channel.
pub struct Multiplexer {
    transport: Arc<dyn UpstreamTransport>,
    state: Mutex<MuxState>,
    next_id: AtomicI64,
}

impl Multiplexer {
    /// Wrap an opened upstream and start dispatching its events.
    pub fn start(transport: Arc<dyn UpstreamTransport>, events: UpstreamEvents) -> Arc<Self> {
        let mux = Arc::new(Self {
            transport,
            state: Mutex::new(MuxState::default()),
            next_id: AtomicI64::new(1),
        });
        tokio::spawn(dispatch(Arc::downgrade(&mux), events));
        mux
    }

    /// Name of the underlying upstream.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Register a session and get its delivery queue.
    pub async fn attach(&self, session_id: Uuid) -> TetherResult<mpsc::UnboundedReceiver<Delivery>> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.closed {
            return Err(TetherError::Bridge(format!("upstream is closed: {reason}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.routes.insert(session_id, tx);
        state.attach_order.push(session_id);
        debug!(upstream = %self.name(), session_id = %session_id, attached = state.routes.len(), "Session attached");
        Ok(rx)
    }

    /// Unregister a session and discard its outstanding requests.
    pub async fn detach(&self, session_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        state.routes.remove(&session_id);
        state.attach_order.retain(|id| *id != session_id);
        if state.last_active == Some(session_id) {
            state.last_active = None;
        }
        state.server_requests.retain(|_, owner| *owner != session_id);
        let before = state.pending.len();
        state.pending.retain(|_, p| p.session_id != session_id);
        let discarded = before - state.pending.len();
        debug!(upstream = %self.name(), session_id = %session_id, discarded, "Session detached");
        discarded
    }

    /// Send one message from a session upstream.
    pub async fn forward(&self, session_id: Uuid, mut message: JsonRpcMessage) -> TetherResult<()> {
        match message.kind() {
            MessageKind::Request => {
                let original_id = message.id().ok_or_else(|| {
                    TetherError::Protocol("request id must be a string or integer".into())
                })?;
                let upstream_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                {
                    let mut state = self.state.lock().await;
                    if !state.routes.contains_key(&session_id) {
                        return Err(TetherError::Bridge("session is not attached".into()));
                    }
                    state.pending.insert(
                        upstream_id,
                        PendingRequest {
                            session_id,
                            original_id: original_id.clone(),
                        },
                    );
                    state.last_active = Some(session_id);
                }
                message.set_id(&RequestId::Number(upstream_id));
                debug!(
                    session_id = %session_id,
                    method = message.method().unwrap_or_default(),
                    client_id = %original_id,
                    upstream_id,
                    "Forwarding request"
                );
                if let Err(e) = self.transport.send(&message).await {
                    self.state.lock().await.pending.remove(&upstream_id);
                    return Err(e);
                }
                Ok(())
            }
            MessageKind::Notification => {
                self.state.lock().await.last_active = Some(session_id);
                self.transport.send(&message).await
            }
            MessageKind::Response => {
                let owned = match message.id() {
                    Some(id) => {
                        let mut state = self.state.lock().await;
                        if state.server_requests.get(&id) == Some(&session_id) {
                            state.server_requests.remove(&id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                if !owned {
                    warn!(session_id = %session_id, id = ?message.id(), "Dropping response to a request this session was not sent");
                    return Ok(());
                }
                self.transport.send(&message).await
            }
        }
    }

    /// Close the upstream channel.
    pub async fn close(&self) -> TetherResult<()> {
        self.transport.close().await
    }

    /// Number of attached sessions.
    pub async fn attached_count(&self) -> usize {
        self.state.lock().await.routes.len()
    }

    /// Number of requests awaiting an upstream response.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Whether the upstream has reported end of stream.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed.is_some()
    }

    async fn route_upstream(&self, mut message: JsonRpcMessage) {
        match message.kind() {
            MessageKind::Response => {
                let Some(RequestId::Number(upstream_id)) = message.id() else {
                    warn!(upstream = %self.name(), id = ?message.id(), "Dropping upstream response with foreign id");
                    return;
                };
                let mut state = self.state.lock().await;
                let Some(pending) = state.pending.remove(&upstream_id) else {
                    warn!(upstream = %self.name(), upstream_id, "Dropping unmatched upstream response");
                    return;
                };
                let Some(route) = state.routes.get(&pending.session_id) else {
                    debug!(session_id = %pending.session_id, upstream_id, "Owner detached, dropping response");
                    return;
                };
                message.set_id(&pending.original_id);
                let _ = route.send(Delivery::Message(message));
            }
            MessageKind::Notification => {
                let state = self.state.lock().await;
                for route in state.routes.values() {
                    let _ = route.send(Delivery::Message(message.clone()));
                }
            }
            MessageKind::Request => {
                let Some(id) = message.id() else {
                    return;
                };
                let delivered = {
                    let mut state = self.state.lock().await;
                    match state.server_request_target() {
                        Some(target) => {
                            state.server_requests.insert(id.clone(), target);
                            if let Some(route) = state.routes.get(&target) {
                                let _ = route.send(Delivery::Message(message.clone()));
                            }
                            debug!(session_id = %target, id = %id, method = message.method().unwrap_or_default(), "Routed worker request");
                            true
                        }
                        None => false,
                    }
                };
                if !delivered {
                    warn!(upstream = %self.name(), id = %id, "No session to receive worker request");
                    let reply = JsonRpcMessage::error_response(id, NO_SESSION_ERROR, "No client session available");
                    if let Err(e) = self.transport.send(&reply).await {
                        warn!(upstream = %self.name(), error = %e, "Failed to reject worker request");
                    }
                }
            }
        }
    }

    async fn mark_closed(&self, reason: String) {
        let mut state = self.state.lock().await;
        info!(upstream = %self.name(), reason = %reason, sessions = state.routes.len(), "Upstream closed");
        for route in state.routes.values() {
            let _ = route.send(Delivery::UpstreamClosed {
                reason: reason.clone(),
            });
        }
        state.pending.clear();
        state.server_requests.clear();
        state.closed = Some(reason);
    }
}

async fn dispatch(mux: Weak<Multiplexer>, mut events: UpstreamEvents) {
    while let Some(event) = events.recv().await {
        let Some(mux) = mux.upgrade() else {
            return;
        };
        match event {
            UpstreamEvent::Message(message) => mux.route_upstream(message).await,
            UpstreamEvent::Closed { reason } => {
                mux.mark_closed(reason).await;
                return;
            }
        }
    }
    if let Some(mux) = mux.upgrade() {
        mux.mark_closed("upstream event stream ended".into()).await;
    }
}

/// Everything one session's relay loop works with.
pub(crate) struct SessionLink {
    pub session_id: Uuid,
    pub inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub outbound: mpsc::UnboundedSender<axum::response::sse::Event>,
    pub disconnected: oneshot::Receiver<()>,
    pub shutdown: watch::Receiver<bool>,
}

/// Relay one session until it ends. Posted messages go upstream in the order
/// they were queued; deliveries go to the push channel.
pub(crate) async fn relay(mut link: SessionLink, mux: &Multiplexer) -> CloseReason {
    if *link.shutdown.borrow() {
        return CloseReason::Shutdown;
    }
    loop {
        tokio::select! {
            _ = &mut link.disconnected => return CloseReason::RemoteDisconnected,
            Ok(()) = link.shutdown.changed() => {
                if *link.shutdown.borrow() {
                    return CloseReason::Shutdown;
                }
            }
            Some(message) = link.inbound.recv() => {
                match mux.forward(link.session_id, message).await {
                    Ok(()) => {}
                    Err(TetherError::Protocol(reason)) => {
                        warn!(session_id = %link.session_id, reason = %reason, "Rejected client message");
                    }
                    Err(e) => return CloseReason::BridgeFailure(e.to_string()),
                }
            }
            Some(delivery) = link.deliveries.recv() => match delivery {
                Delivery::Message(message) => {
                    let Some(event) = message_event(&message) else {
                        continue;
                    };
                    if link.outbound.send(event).is_err() {
                        return CloseReason::RemoteDisconnected;
                    }
                }
                Delivery::UpstreamClosed { reason } => return CloseReason::UpstreamClosed(reason),
            },
            else => return CloseReason::BridgeFailure("session channels closed".into()),
        }
    }
}

/// SSE `message` event carrying one JSON-RPC message.
pub(crate) fn message_event(message: &JsonRpcMessage) -> Option<axum::response::sse::Event> {
    match message.to_line() {
        Ok(line) => Some(axum::response::sse::Event::default().event("message").data(line)),
        Err(e) => {
            warn!(error = %e, "Failed to encode message for push channel");
            None
        }
    }
}
