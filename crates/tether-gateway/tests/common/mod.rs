#![allow(dead_code)]
//! Shared helpers: an in-process echo worker, a gateway on a random port and
//! a minimal SSE reader.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_auth::{AuthConfig, AuthResolver};
use tether_core::{JsonRpcMessage, MessageKind, TetherResult};
use tether_gateway::{
    CloseReason, GatewayConfig, GatewayHandle, GatewayServer, Multiplexer, SessionFactory,
    SessionInfo, SessionObserver, SessionRequest, SessionUpstream, SharedWorkerFactory,
};
use tether_upstream::ChannelUpstream;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Observer that records every lifecycle callback.
#[derive(Default)]
pub struct RecordingObserver {
    pub connected: Mutex<Vec<SessionInfo>>,
    pub closed: Mutex<Vec<(SessionInfo, CloseReason)>>,
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_connect(&self, session: &SessionInfo) {
        self.connected.lock().await.push(session.clone());
    }

    async fn on_close(&self, session: &SessionInfo, reason: &CloseReason) {
        self.closed
            .lock()
            .await
            .push((session.clone(), reason.clone()));
    }
}

/// Factory that records requests and hands out the shared worker.
pub struct RecordingFactory {
    inner: SharedWorkerFactory,
    pub requests: Mutex<Vec<SessionRequest>>,
}

#[async_trait]
impl SessionFactory for RecordingFactory {
    async fn create(&self, request: &SessionRequest) -> TetherResult<SessionUpstream> {
        self.requests.lock().await.push(request.clone());
        self.inner.create(request).await
    }
}

/// Factory that always fails.
pub struct FailingFactory;

#[async_trait]
impl SessionFactory for FailingFactory {
    async fn create(&self, _request: &SessionRequest) -> TetherResult<SessionUpstream> {
        Err(tether_core::TetherError::Construction("no capacity".into()))
    }
}

/// Spawn an echo worker on an in-process channel.
///
/// - request `echo` answers `{"method": .., "params": ..}`
/// - request `hold` is never answered
/// - request `shout` first broadcasts `notifications/shout`, then answers
/// - responses from clients are forwarded to `seen`
pub fn echo_worker() -> (
    Arc<Multiplexer>,
    mpsc::UnboundedReceiver<JsonRpcMessage>,
    oneshot::Sender<String>,
) {
    let (upstream, events, mut worker) = ChannelUpstream::pair("echo");
    let mux = Multiplexer::start(Arc::new(upstream), events);
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (kill_tx, mut kill_rx) = oneshot::channel::<String>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                reason = &mut kill_rx => {
                    worker.close(reason.unwrap_or_else(|_| "killed".into()));
                    return;
                }
                msg = worker.recv() => {
                    let Some(msg) = msg else { return };
                    let _ = seen_tx.send(msg.clone());
                    if msg.kind() != MessageKind::Request {
                        continue;
                    }
                    let id = msg.id().unwrap();
                    let params = msg.get("params").cloned().unwrap_or(serde_json::Value::Null);
                    match msg.method() {
                        Some("hold") => {}
                        Some("shout") => {
                            worker
                                .send(JsonRpcMessage::notification("notifications/shout", params.clone()))
                                .unwrap();
                            worker
                                .send(JsonRpcMessage::response(id, serde_json::json!({"shouted": true})))
                                .unwrap();
                        }
                        method => {
                            worker
                                .send(JsonRpcMessage::response(
                                    id,
                                    serde_json::json!({"method": method, "params": params}),
                                ))
                                .unwrap();
                        }
                    }
                }
            }
        }
    });

    (mux, seen_rx, kill_tx)
}

pub struct TestGateway {
    pub addr: String,
    pub handle: GatewayHandle,
    pub observer: Arc<RecordingObserver>,
    pub factory: Arc<RecordingFactory>,
    pub seen: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    pub kill: Mutex<Option<oneshot::Sender<String>>>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Close the echo worker as if the process had exited.
    pub async fn kill_worker(&self, reason: &str) {
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(reason.to_string());
        }
    }

    /// Next message the worker received from the bridge.
    pub async fn next_seen(&self) -> JsonRpcMessage {
        tokio::time::timeout(Duration::from_secs(2), self.seen.lock().await.recv())
            .await
            .expect("worker saw nothing")
            .expect("worker channel closed")
    }

    /// Wait until the registry holds `n` sessions.
    pub async fn wait_for_sessions(&self, n: usize) {
        for _ in 0..100 {
            if self.handle.session_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "expected {n} sessions, have {}",
            self.handle.session_count().await
        );
    }

    /// Wait until `n` close callbacks have fired, then return them.
    pub async fn wait_for_closed(&self, n: usize) -> Vec<(SessionInfo, CloseReason)> {
        for _ in 0..100 {
            let closed = self.observer.closed.lock().await.clone();
            if closed.len() >= n {
                return closed;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {n} closed sessions");
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        keep_alive_secs: 1,
        ..GatewayConfig::default()
    }
}

pub fn static_key_auth(key: &str) -> AuthConfig {
    AuthConfig {
        api_key: Some(key.to_string()),
        ..AuthConfig::default()
    }
}

pub async fn serve(router: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("127.0.0.1:{}", addr.port())
}

pub async fn start_gateway(auth: AuthConfig) -> TestGateway {
    start_gateway_with(auth, test_config(), None).await
}

pub async fn start_gateway_with(
    auth: AuthConfig,
    config: GatewayConfig,
    fallback: Option<axum::Router>,
) -> TestGateway {
    let (mux, seen, kill) = echo_worker();
    let factory = Arc::new(RecordingFactory {
        inner: SharedWorkerFactory::new(mux),
        requests: Mutex::new(Vec::new()),
    });
    let observer = Arc::new(RecordingObserver::default());
    let resolver = Arc::new(AuthResolver::new(&auth).unwrap());

    let mut server =
        GatewayServer::new(config, resolver, factory.clone()).with_observer(observer.clone());
    if let Some(fallback) = fallback {
        server = server.with_fallback(fallback);
    }
    let (router, handle) = server.build().unwrap();
    let addr = serve(router).await;

    TestGateway {
        addr,
        handle,
        observer,
        factory,
        seen: Mutex::new(seen),
        kill: Mutex::new(Some(kill)),
    }
}

/// One parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap()
    }
}

/// Reads events off a streaming response body.
pub struct SseClient {
    response: reqwest::Response,
    buffer: String,
}

impl SseClient {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: String::new(),
        }
    }

    /// Next event, skipping keep-alive comments. `None` when the stream ends.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..pos + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return Some(event);
                }
                continue;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.response.chunk())
                .await
                .expect("timed out waiting for SSE data")
                .ok()??;
            self.buffer
                .push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
        }
    }

    /// Next event that is not an SSE keep-alive, expected to be a JSON-RPC message.
    pub async fn next_message(&mut self) -> serde_json::Value {
        let event = self.next_event().await.expect("stream ended");
        assert_eq!(event.event, "message");
        event.json()
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// An open session as seen by a client.
pub struct Connected {
    pub client: SseClient,
    pub session_id: String,
    pub endpoint: String,
    pub established: serde_json::Value,
}

pub async fn open_stream(gw: &TestGateway, key: Option<&str>) -> reqwest::Response {
    let mut request = reqwest::Client::new().get(gw.url("/sse"));
    if let Some(key) = key {
        request = request.header("x-api-key", key);
    }
    request.send().await.unwrap()
}

/// Connect and consume the announcement events.
pub async fn connect(gw: &TestGateway, key: Option<&str>) -> Connected {
    let response = open_stream(gw, key).await;
    assert_eq!(response.status(), 200);
    let mut client = SseClient::new(response);

    let endpoint = client.next_event().await.unwrap();
    assert_eq!(endpoint.event, "endpoint");
    let session_id = endpoint
        .data
        .split("sessionId=")
        .nth(1)
        .unwrap()
        .to_string();
    let established = client.next_message().await;

    Connected {
        client,
        session_id,
        endpoint: endpoint.data,
        established,
    }
}

pub async fn post_message(
    gw: &TestGateway,
    endpoint: &str,
    body: serde_json::Value,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(gw.url(endpoint))
        .json(&body)
        .send()
        .await
        .unwrap()
}
