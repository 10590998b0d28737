//! SSE front end and session bridge for Tether.
//!
//! Admits push-stream connections, tracks one session per connection and
//! relays JSON-RPC traffic between every session and its upstream worker.
//!
//! # Main types
//!
//! - [`GatewayServer`]: Builds the axum router (`/sse`, `/messages`, `/ping`, `/health`).
//! - [`GatewayHandle`]: Session count and graceful shutdown for a built gateway.
//! - [`SessionRegistry`]: Owned map of live sessions and their lifecycle state.
//! - [`Multiplexer`]: Correlates requests and responses over one upstream channel.
//! - [`SessionFactory`]: Supplies each new session's upstream (shared or dedicated worker).
//! - [`SessionObserver`]: `on_connect` / `on_close` lifecycle hooks.

/// Message bridge: multiplexer and per-session relay.
pub mod bridge;
/// Per-session upstream construction.
pub mod factory;
/// CORS, custom headers and credential extraction.
pub mod middleware;
/// Session lifecycle hooks.
pub mod observer;
/// Router, handlers and shutdown control.
pub mod server;
/// Session registry.
pub mod session;

pub use bridge::{Delivery, Multiplexer};
pub use factory::{
    PerSessionWorkerFactory, SessionFactory, SessionRequest, SessionUpstream,
    SharedWorkerFactory,
};
pub use middleware::extract_credential;
pub use observer::{CloseReason, LoggingObserver, SessionObserver};
pub use server::{ApiError, GatewayConfig, GatewayHandle, GatewayServer, CONNECTION_ESTABLISHED};
pub use session::{SessionInfo, SessionRegistry, SessionState};
