use std::sync::Arc;

use jobmesh_core::{RecordPath, SessionId};

use crate::change::ChangeSubscription;
use crate::error::StoreError;
use crate::lock::{LockOptions, LockToken};
use crate::query::Query;
use crate::value::{Properties, Record};

/// Shared hierarchical store that every cluster member talks to.
///
/// Implementations must be shareable across threads; sessions are opened per
/// unit of work and must not be used for writes on more than one thread at a
/// time by convention (the job engine keeps one long-lived background session
/// and opens short-lived ones for completion handling).
pub trait Repository: Send + Sync + 'static {
    type Session: Session + 'static;

    /// Open a new session. Each session has its own identity for lock
    /// ownership.
    fn login(&self) -> Result<Self::Session, StoreError>;

    /// Subscribe to changes at `root` or anywhere below it, from any session.
    fn observe(&self, root: &RecordPath) -> Result<ChangeSubscription, StoreError>;
}

impl<R: Repository> Repository for Arc<R> {
    type Session = R::Session;

    fn login(&self) -> Result<Self::Session, StoreError> {
        (**self).login()
    }

    fn observe(&self, root: &RecordPath) -> Result<ChangeSubscription, StoreError> {
        (**self).observe(root)
    }
}

/// One authenticated connection to the store.
///
/// Writes to a record locked by another session fail with
/// `StoreError::Locked`. Dropping a session releases the session-scoped locks
/// it still holds.
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Discard any cached view so the next read observes other sessions'
    /// writes.
    fn refresh(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn exists(&self, path: &RecordPath) -> Result<bool, StoreError>;

    fn get(&self, path: &RecordPath) -> Result<Option<Record>, StoreError>;

    /// Create `path` and any missing ancestors as empty records.
    fn ensure_path(&self, path: &RecordPath) -> Result<(), StoreError>;

    /// Create a record. The parent must exist and `path` must not.
    ///
    /// With `lock` set the record is created already locked by this session,
    /// atomically: no other session can observe it unlocked.
    fn create(
        &self,
        path: &RecordPath,
        properties: Properties,
        lock: Option<LockOptions>,
    ) -> Result<Option<LockToken>, StoreError>;

    /// Add or overwrite properties.
    fn set_properties(&self, path: &RecordPath, properties: Properties) -> Result<(), StoreError>;

    /// Remove a record and everything below it.
    fn remove(&self, path: &RecordPath) -> Result<(), StoreError>;

    fn lock(&self, path: &RecordPath, options: LockOptions) -> Result<LockToken, StoreError>;

    /// Push out the expiry of a timed lock held by this session.
    fn refresh_lock(&self, token: &LockToken) -> Result<(), StoreError>;

    fn unlock(&self, path: &RecordPath) -> Result<(), StoreError>;

    /// Take over a token released by another session via `remove_lock_token`.
    fn add_lock_token(&self, token: &LockToken) -> Result<LockToken, StoreError>;

    /// Give up ownership of a token without unlocking the record.
    fn remove_lock_token(&self, token: &LockToken) -> Result<(), StoreError>;

    fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError>;
}
