use thiserror::Error;

use flowgrid_registry::RegistryError;
use flowgrid_state::StateError;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("work store error: {0}")]
    Store(#[from] StateError),

    #[error("invalid server record at {path}: {message}")]
    InvalidRecord { path: String, message: String },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("coordinator already started")]
    AlreadyStarted,
}
