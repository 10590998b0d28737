//! In-process upstream backed by channels.
//!
//! Used to embed a worker in the same process, and by tests to drive the
//! bridge without spawning anything.

use crate::transport::{UpstreamEvent, UpstreamEvents, UpstreamTransport};
use async_trait::async_trait;
use tether_core::{JsonRpcMessage, TetherError, TetherResult};
use tokio::sync::{mpsc, Mutex};

/// Bridge-side half of an in-process duplex.
pub struct ChannelUpstream {
    to_worker: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    name: String,
}

/// Worker-side half of an in-process duplex.
pub struct WorkerEnd {
    incoming: mpsc::UnboundedReceiver<JsonRpcMessage>,
    outgoing: mpsc::UnboundedSender<UpstreamEvent>,
}

impl ChannelUpstream {
    /// Create a connected pair.
    pub fn pair(name: impl Into<String>) -> (Self, UpstreamEvents, WorkerEnd) {
        let (to_worker, incoming) = mpsc::unbounded_channel();
        let (outgoing, events) = mpsc::unbounded_channel();
        (
            Self {
                to_worker: Mutex::new(Some(to_worker)),
                name: name.into(),
            },
            events,
            WorkerEnd { incoming, outgoing },
        )
    }
}

#[async_trait]
impl UpstreamTransport for ChannelUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &JsonRpcMessage) -> TetherResult<()> {
        let guard = self.to_worker.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| TetherError::Upstream("worker channel is closed".into()))?;
        tx.send(message.clone())
            .map_err(|_| TetherError::Upstream("worker has gone away".into()))
    }

    async fn close(&self) -> TetherResult<()> {
        self.to_worker.lock().await.take();
        Ok(())
    }
}

impl WorkerEnd {
    /// Next message written by the bridge, or `None` once the bridge closed.
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        self.incoming.recv().await
    }

    /// Emit a message towards the bridge.
    pub fn send(&self, message: JsonRpcMessage) -> TetherResult<()> {
        self.outgoing
            .send(UpstreamEvent::Message(message))
            .map_err(|_| TetherError::Upstream("bridge has gone away".into()))
    }

    /// Signal end of stream to the bridge, consuming the worker end.
    pub fn close(self, reason: impl Into<String>) {
        let _ = self.outgoing.send(UpstreamEvent::Closed {
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tether_core::RequestId;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (upstream, mut events, mut worker) = ChannelUpstream::pair("mem");
        let req = JsonRpcMessage::request(RequestId::Number(1), "ping", serde_json::json!({}));
        upstream.send(&req).await.unwrap();

        let got = worker.recv().await.unwrap();
        assert_eq!(got.method(), Some("ping"));

        worker
            .send(JsonRpcMessage::response(RequestId::Number(1), serde_json::json!({})))
            .unwrap();
        match events.recv().await.unwrap() {
            UpstreamEvent::Message(msg) => assert_eq!(msg.id(), Some(RequestId::Number(1))),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (upstream, _events, mut worker) = ChannelUpstream::pair("mem");
        upstream.close().await.unwrap();
        upstream.close().await.unwrap();
        let note = JsonRpcMessage::notification("x", serde_json::json!({}));
        assert!(upstream.send(&note).await.is_err());
        assert!(worker.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_close_emits_closed_event() {
        let (_upstream, mut events, worker) = ChannelUpstream::pair("mem");
        worker.close("done");
        assert_eq!(
            events.recv().await.unwrap(),
            UpstreamEvent::Closed {
                reason: "done".into()
            }
        );
    }
}
