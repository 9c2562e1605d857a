//! Error types for the client.

use envseal_core::CoreError;
use envseal_graph::GraphError;
use envseal_store::StoreError;
use envseal_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A signature, trust chain, identity hash or key/blob pairing did not
    /// check out. Local trust state should be treated as suspect.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The server or the local permission check refused the operation.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Envs needed for the operation are not decrypted locally yet.
    #[error("envs not fetched: {0}")]
    TransientFetch(String),

    /// The server's graph moved on; refresh and retry.
    #[error("graph outdated, server is at {server_updated_at}")]
    StaleGraph { server_updated_at: u64 },

    /// The server is rate limiting writes.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Waited too long for other work to finish.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The server answered with a response of the wrong kind.
    #[error("unexpected response, wanted {0}")]
    UnexpectedResponse(&'static str),

    #[error("crypto error: {0}")]
    Crypto(#[from] CoreError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(SyncError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Errors after which cached trust and envs must not be reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Integrity(_) | ClientError::Timeout(_) | ClientError::Crypto(_)
        )
    }
}

impl From<SyncError> for ClientError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Forbidden(msg) => ClientError::Authorization(msg),
            SyncError::Throttled(msg) => ClientError::Throttled(msg),
            SyncError::GraphOutdated { server_updated_at } => {
                ClientError::StaleGraph { server_updated_at }
            }
            other => ClientError::Sync(other),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
