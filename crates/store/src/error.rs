use thiserror::Error;

use jobmesh_core::RecordPath;

/// Store operation error.
///
/// `Locked` is the expected outcome of contention between cluster members;
/// `Unavailable` and `Storage` are transient infrastructure failures that
/// callers log and retry on a later cycle.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(RecordPath),

    #[error("record already exists: {0}")]
    AlreadyExists(RecordPath),

    #[error("record is locked by another session: {0}")]
    Locked(RecordPath),

    #[error("lock on {0} is not held by this session")]
    LockNotHeld(RecordPath),

    #[error("record is not locked: {0}")]
    NotLocked(RecordPath),

    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Network blips, stale sessions, poisoned locks: worth another try later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Storage(_))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Storage("lock poisoned".to_string())
    }
}
