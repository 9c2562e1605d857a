//! Error types for the sync module.

use thiserror::Error;

/// Failures reported by the server or the transport.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server rejected the request for lack of permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Rate limited.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The request was built against an older graph than the server holds.
    #[error("graph outdated: server is at {server_updated_at}")]
    GraphOutdated { server_updated_at: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Request was well-formed but inconsistent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("graph error: {0}")]
    Graph(#[from] envseal_graph::GraphError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
