//! Core types and error definitions for the Tether bridge.
//!
//! This crate provides the foundational types shared across all Tether crates:
//! the error taxonomy used at every boundary of the bridge and the JSON-RPC
//! message model relayed between remote sessions and the upstream worker.
//!
//! # Main types
//!
//! - [`TetherError`]: Unified error enum for all Tether subsystems.
//! - [`TetherResult`]: Convenience alias for `Result<T, TetherError>`.
//! - [`JsonRpcMessage`]: A single JSON-RPC 2.0 message, kept verbatim.
//! - [`RequestId`]: A JSON-RPC request identifier (number or string).
//! - [`MessageKind`]: Request, notification or response.

/// JSON-RPC 2.0 message model.
pub mod jsonrpc;

pub use jsonrpc::{JsonRpcMessage, MessageKind, RequestId, JSONRPC_VERSION};

// --- Error types ---

/// Top-level error type for the Tether bridge.
///
/// Each variant corresponds to a failure class that is resolved at the
/// boundary where it occurs.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A connection attempt was rejected: missing or invalid credential.
    #[error("Unauthorized: {0}")]
    Admission(String),

    /// A posted message could not be routed to an active session.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The per-session factory failed to construct the session's upstream.
    #[error("Session construction failed: {0}")]
    Construction(String),

    /// Relay failure while a session is active.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// The delegate verification service could not be reached.
    #[error("Delegate unreachable: {0}")]
    DelegateUnreachable(String),

    /// The upstream worker channel failed (spawn, write or read).
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A payload was not a well-formed JSON-RPC message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`TetherError`].
pub type TetherResult<T> = Result<T, TetherError>;
