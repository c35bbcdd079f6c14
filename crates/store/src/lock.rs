//! Lock tokens and lock options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobmesh_core::{RecordPath, SessionId};

/// Handle to an exclusive record lock.
///
/// Ownership is scoped to a session. A token obtained by one session must be
/// moved explicitly (`remove_lock_token` on the source, `add_lock_token` on
/// the target) before another session can unlock the record; the target hands
/// back a token stamped with its own session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    path: RecordPath,
    token: String,
    session: SessionId,
}

impl LockToken {
    pub fn new(path: RecordPath, token: impl Into<String>, session: SessionId) -> Self {
        Self {
            path,
            token: token.into(),
            session,
        }
    }

    pub fn path(&self) -> &RecordPath {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Session that held the token when this value was issued.
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn reissued(&self, session: SessionId) -> Self {
        Self {
            path: self.path.clone(),
            token: self.token.clone(),
            session,
        }
    }
}

/// How a lock is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Released automatically when the holding session goes away.
    pub session_scoped: bool,
    /// Lapses after this long unless refreshed.
    pub timeout: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            session_scoped: true,
            timeout: None,
        }
    }
}

impl LockOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}
