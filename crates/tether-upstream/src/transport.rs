use async_trait::async_trait;
use tether_core::{JsonRpcMessage, TetherResult};
use tokio::sync::mpsc;

/// Something the upstream worker produced.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// One JSON-RPC message from the worker.
    Message(JsonRpcMessage),
    /// The channel ended; no further events follow.
    Closed {
        /// Human-readable cause, for logs.
        reason: String,
    },
}

/// Receiver half of an upstream channel.
pub type UpstreamEvents = mpsc::UnboundedReceiver<UpstreamEvent>;

/// Outbound half of an upstream channel.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Write one message to the worker.
    async fn send(&self, message: &JsonRpcMessage) -> TetherResult<()>;

    /// Shut the channel down. Calling it twice is a no-op.
    async fn close(&self) -> TetherResult<()>;
}
