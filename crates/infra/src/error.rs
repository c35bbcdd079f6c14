use thiserror::Error;

use jobmesh_store::StoreError;

use crate::config::ConfigError;

/// Failure to bring the job engine up (or to hand it work).
#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("activation failed: {0}")]
    Activation(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("event bus error: {0}")]
    Bus(String),
}
