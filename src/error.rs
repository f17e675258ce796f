//! Gateway error taxonomy.
//!
//! Per-message protocol violations are answered inline with JSON-RPC error
//! replies (see [`codes`]) and never tear a session down. The variants here
//! cover the failures that do: startup, initialization, server death.

use std::time::Duration;

use thiserror::Error;

/// JSON-RPC error codes sent back to the client.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The language server child process could not be spawned, or exited
    /// during the startup grace period.
    #[error("language server failed to start: {0}")]
    Startup(String),

    /// The LSP `initialize` handshake failed or timed out.
    #[error("language server initialization failed: {0}")]
    Initialization(String),

    /// The language server process died (or was stopped) while the operation
    /// was in flight.
    #[error("language server terminated")]
    Terminated,

    /// A single request exceeded its deadline. Scoped to the one observer;
    /// the server-side work is not cancelled.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A request-shaped operation was attempted on a message without an id.
    #[error("message has no request id")]
    MissingId,

    /// A session with the same id is already live.
    #[error("session {0} is already registered")]
    DuplicateSession(String),

    /// The requested language tag has no configured server command.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
