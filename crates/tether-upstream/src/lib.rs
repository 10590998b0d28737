//! Upstream channels for the Tether bridge.
//!
//! An upstream is a duplex JSON-RPC message stream to one worker. Outbound
//! messages go through [`UpstreamTransport::send`]; inbound messages and the
//! end-of-stream signal arrive on an [`UpstreamEvents`] receiver returned when
//! the channel is opened.

pub mod config;
pub mod memory;
pub mod stdio;
pub mod transport;

pub use config::{UpstreamConfig, WorkerMode};
pub use memory::{ChannelUpstream, WorkerEnd};
pub use stdio::StdioUpstream;
pub use transport::{UpstreamEvent, UpstreamEvents, UpstreamTransport};
