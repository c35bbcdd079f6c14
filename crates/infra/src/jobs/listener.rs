//! Change listener: turns store changes under the job root into queue items.
//!
//! A record becomes interesting when its `active` property appears or changes,
//! or when its lock goes away (a member finished an attempt, rescheduled, or
//! crashed). In each case the record is re-read and queued if it is active
//! and nobody holds it. Locks this process gives up on purpose are suppressed
//! once, so a delayed retry is not pulled forward by its own unlock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use jobmesh_core::RecordPath;
use jobmesh_store::{ChangeEvent, ChangeKind, Session, StoreError};

use super::codec::{self, PROPERTY_ACTIVE};
use super::queue::{DispatchQueue, JobInfo};

/// How long a mark waits for its unlock notification before it is dropped.
pub const OWN_RELEASE_TTL: Duration = Duration::from_secs(30);

/// Paths whose next lock release was caused by this process.
///
/// A mark whose notification never arrives (lost, or the unlock failed
/// without `unmark`) lapses after its ttl, so it cannot swallow a later
/// release by another member.
#[derive(Debug)]
pub struct OwnReleases {
    ttl: Duration,
    marks: Mutex<HashMap<RecordPath, Instant>>,
}

impl Default for OwnReleases {
    fn default() -> Self {
        Self::with_ttl(OWN_RELEASE_TTL)
    }
}

impl OwnReleases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, path: &RecordPath) {
        let ttl = self.ttl;
        self.with(|marks| {
            marks.retain(|_, at| at.elapsed() < ttl);
            marks.insert(path.clone(), Instant::now());
        });
    }

    /// Undo a mark when the unlock it was meant for did not happen.
    pub fn unmark(&self, path: &RecordPath) {
        self.with(|marks| {
            marks.remove(path);
        });
    }

    /// Consume the mark for `path`; `true` if there was a live one.
    pub fn take(&self, path: &RecordPath) -> bool {
        let ttl = self.ttl;
        self.with(|marks| marks.remove(path).is_some_and(|at| at.elapsed() < ttl))
    }

    pub fn len(&self) -> usize {
        self.with(|marks| marks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<RecordPath, Instant>) -> T) -> T {
        match self.marks.lock() {
            Ok(mut marks) => f(&mut marks),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

fn is_relevant(change: &ChangeEvent) -> bool {
    change.kind == ChangeKind::LockReleased || change.touches(PROPERTY_ACTIVE)
}

/// React to one change. Returns `true` when a job was queued.
pub fn handle_change<S: Session>(
    session: &S,
    change: &ChangeEvent,
    root: &RecordPath,
    queue: &DispatchQueue,
    own_releases: &OwnReleases,
) -> Result<bool, StoreError> {
    if !is_relevant(change) || !change.path.is_descendant_of(root) {
        return Ok(false);
    }
    if change.kind == ChangeKind::LockReleased && own_releases.take(&change.path) {
        trace!(path = %change.path, "ignoring own unlock");
        return Ok(false);
    }
    if queue.is_pending(&change.path) {
        return Ok(false);
    }

    session.refresh()?;
    let Some(record) = session.get(&change.path)? else {
        return Ok(false);
    };
    if record.is_locked() || !codec::is_active(&record) {
        return Ok(false);
    }

    match codec::read(&record) {
        Ok(event) => {
            let queued = queue.enqueue(JobInfo::stored(event, record.path.clone()));
            if queued {
                debug!(path = %record.path, kind = ?change.kind, "job became claimable");
            }
            Ok(queued)
        }
        Err(e) => {
            warn!(path = %record.path, error = %e, "skipping undecodable job record");
            Ok(false)
        }
    }
}
