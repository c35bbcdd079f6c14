//! Change notifications scoped to a subtree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobmesh_core::{RecordPath, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    PropertyAdded,
    PropertyChanged,
    PropertyRemoved,
    NodeRemoved,
    LockReleased,
}

/// One observed change, tagged with the session that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: RecordPath,
    pub property: Option<String>,
    pub session: SessionId,
}

impl ChangeEvent {
    pub fn property(kind: ChangeKind, path: RecordPath, name: impl Into<String>, session: SessionId) -> Self {
        Self {
            kind,
            path,
            property: Some(name.into()),
            session,
        }
    }

    pub fn node(kind: ChangeKind, path: RecordPath, session: SessionId) -> Self {
        Self {
            kind,
            path,
            property: None,
            session,
        }
    }

    /// True for an add or change of `name`.
    pub fn touches(&self, name: &str) -> bool {
        matches!(self.kind, ChangeKind::PropertyAdded | ChangeKind::PropertyChanged)
            && self.property.as_deref() == Some(name)
    }
}

/// Receiving end of a subtree observation.
///
/// Dropping it unsubscribes. Feeders that block outside the channel (a
/// pub/sub connection) poll `closed_flag` to notice.
#[derive(Debug)]
pub struct ChangeSubscription {
    receiver: Receiver<ChangeEvent>,
    closed: Arc<AtomicBool>,
}

impl ChangeSubscription {
    pub fn new(receiver: Receiver<ChangeEvent>) -> Self {
        Self {
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raised when this subscription is dropped.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn try_recv(&self) -> Result<ChangeEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChangeEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn dropping_the_subscription_raises_the_closed_flag() {
        let (_tx, rx) = mpsc::channel();
        let subscription = ChangeSubscription::new(rx);
        let closed = subscription.closed_flag();
        assert!(!closed.load(Ordering::SeqCst));

        drop(subscription);
        assert!(closed.load(Ordering::SeqCst));
    }
}
