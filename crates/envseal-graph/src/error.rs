//! Error types for the graph crate.

use thiserror::Error;

use envseal_core::{EnvParentId, EnvironmentId, KeyableId};

/// Errors that can occur while reading the org graph or deriving key sets.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(EnvironmentId),

    #[error("unknown env parent: {0}")]
    UnknownEnvParent(EnvParentId),

    #[error("unknown keyable: {0}")]
    UnknownKeyable(KeyableId),

    #[error("keyable parent {0} has no active generated envkey")]
    NoActiveEnvkey(KeyableId),

    #[error("malformed composite: {0}")]
    MalformedComposite(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] envseal_core::CoreError),
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;
