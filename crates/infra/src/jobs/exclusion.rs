//! Cluster-wide exclusion on job records via store locks.
//!
//! A record moves `UNCLAIMED -> CLAIMED -> EXECUTING -> FINISHED` or back to
//! `UNCLAIMED` for another attempt. Claiming is the lock; releasing is the
//! unlock; finishing flips `active` while still holding the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobmesh_core::{ProcessId, RecordPath};
use jobmesh_store::{LockOptions, LockToken, Properties, Session, StoreError, Value};

use super::codec::{JobRecord, PROPERTY_ACTIVE, PROPERTY_FINISHED, is_active};

/// Result of a claim attempt. Losing a claim is the normal outcome when
/// another member got there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(LockToken),
    /// Locked by someone else.
    ClaimFailed,
    /// Gone or already finished.
    NotActive,
}

/// Result of clearing a path for a new job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    /// Nothing is left at the path.
    Vacant,
    /// The record is active on behalf of another member and stays.
    Kept,
    /// Someone holds the record.
    Busy,
}

/// Claims records and keeps track of the locks the background session holds
/// so timed locks can be renewed.
#[derive(Debug)]
pub struct Exclusion {
    options: LockOptions,
    held: Mutex<HashMap<RecordPath, LockToken>>,
}

impl Exclusion {
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            options: LockOptions::default().with_timeout(lock_timeout),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        self.options
    }

    /// Start tracking a token obtained outside `claim` (create-and-lock).
    pub fn adopt(&self, token: LockToken) {
        self.with_held(|held| {
            held.insert(token.path().clone(), token);
        });
    }

    /// Try to take the record for execution.
    ///
    /// The session is refreshed first so `active` is read from a current
    /// view, and re-checked after locking in case another member finished the
    /// job in between.
    pub fn claim<S: Session>(&self, session: &S, path: &RecordPath) -> Result<ClaimOutcome, StoreError> {
        session.refresh()?;
        match session.get(path)? {
            None => return Ok(ClaimOutcome::NotActive),
            Some(record) if !is_active(&record) => return Ok(ClaimOutcome::NotActive),
            Some(record) if record.is_locked() => return Ok(ClaimOutcome::ClaimFailed),
            Some(_) => {}
        }

        let token = match session.lock(path, self.options) {
            Ok(token) => token,
            Err(StoreError::Locked(_)) => {
                debug!(path = %path, "claim lost to another session");
                return Ok(ClaimOutcome::ClaimFailed);
            }
            Err(StoreError::NotFound(_)) => return Ok(ClaimOutcome::NotActive),
            Err(e) => return Err(e),
        };

        let still_active = session.get(path)?.as_ref().is_some_and(is_active);
        if !still_active {
            session.unlock(path)?;
            return Ok(ClaimOutcome::NotActive);
        }

        self.adopt(token.clone());
        Ok(ClaimOutcome::Claimed(token))
    }

    /// Unlock without touching `active` / `finished`; the record stays
    /// claimable.
    pub fn release<S: Session>(&self, session: &S, token: &LockToken) -> Result<(), StoreError> {
        self.forget(token.path());
        session.unlock(token.path())
    }

    /// Move a lock from one session to another and return the token as
    /// issued to the target.
    pub fn transfer<F: Session, T: Session>(
        &self,
        token: &LockToken,
        from: &F,
        to: &T,
    ) -> Result<LockToken, StoreError> {
        self.forget(token.path());
        from.remove_lock_token(token)?;
        match to.add_lock_token(token) {
            Ok(moved) => Ok(moved),
            Err(e) => {
                if let Err(restore) = from.add_lock_token(token) {
                    warn!(path = %token.path(), error = %restore, "could not return lock token to its session");
                }
                Err(e)
            }
        }
    }

    /// Mark the record finished and unlock it. The session must hold the lock.
    pub fn finish<S: Session>(
        &self,
        session: &S,
        token: &LockToken,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut update = Properties::new();
        update.insert(PROPERTY_ACTIVE.into(), Value::Boolean(false));
        update.insert(PROPERTY_FINISHED.into(), Value::Date(at));
        session.set_properties(token.path(), update)?;
        self.release(session, token)
    }

    /// Remove the record at `path` if it is finished, or still active but
    /// written by `owner`.
    ///
    /// The record is locked and re-read before removal, so a peer that
    /// replaced it since the caller last looked keeps its record.
    pub fn remove_replaceable<S: Session>(
        &self,
        session: &S,
        path: &RecordPath,
        owner: ProcessId,
    ) -> Result<Replacement, StoreError> {
        match session.lock(path, LockOptions::default()) {
            Ok(_) => {}
            Err(StoreError::Locked(_)) => return Ok(Replacement::Busy),
            Err(StoreError::NotFound(_)) => return Ok(Replacement::Vacant),
            Err(e) => return Err(e),
        }

        let current = match session.get(path) {
            Ok(current) => current.map(|record| JobRecord::from_record(&record)),
            Err(e) => {
                self.unlock_quietly(session, path);
                return Err(e);
            }
        };
        match current {
            None => Ok(Replacement::Vacant),
            Some(record) if record.active && !record.created_by(owner) => {
                debug!(path = %path, "record was replaced by another member");
                self.unlock_quietly(session, path);
                Ok(Replacement::Kept)
            }
            Some(_) => match session.remove(path) {
                Ok(()) => Ok(Replacement::Vacant),
                Err(e) => {
                    self.unlock_quietly(session, path);
                    Err(e)
                }
            },
        }
    }

    fn unlock_quietly<S: Session>(&self, session: &S, path: &RecordPath) {
        if let Err(e) = session.unlock(path) {
            warn!(path = %path, error = %e, "cannot unlock job record");
        }
    }

    /// Renew every tracked lock; locks that can no longer be renewed are
    /// dropped from tracking. Returns how many were renewed.
    pub fn renew_held<S: Session>(&self, session: &S) -> usize {
        let tokens: Vec<LockToken> = self.with_held(|held| held.values().cloned().collect());
        let mut renewed = 0;
        for token in tokens {
            match session.refresh_lock(&token) {
                Ok(()) => renewed += 1,
                Err(e) => {
                    warn!(path = %token.path(), error = %e, "lost job lock");
                    self.forget(token.path());
                }
            }
        }
        renewed
    }

    pub fn held_count(&self) -> usize {
        self.with_held(|held| held.len())
    }

    fn forget(&self, path: &RecordPath) {
        self.with_held(|held| {
            held.remove(path);
        });
    }

    fn with_held<T>(&self, f: impl FnOnce(&mut HashMap<RecordPath, LockToken>) -> T) -> T {
        match self.held.lock() {
            Ok(mut held) => f(&mut held),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_events::job_request;
    use jobmesh_store::{MemoryRepository, Repository};

    use crate::jobs::codec;

    fn setup() -> (MemoryRepository, RecordPath) {
        let repo = MemoryRepository::new();
        let s = repo.login().unwrap();
        s.ensure_path(&RecordPath::new("/jobs").unwrap()).unwrap();
        let path = RecordPath::new("/jobs/a").unwrap();
        let mut props = Properties::new();
        props.insert(PROPERTY_ACTIVE.into(), Value::Boolean(true));
        s.create(&path, props, None).unwrap();
        (repo, path)
    }

    #[test]
    fn second_claim_fails_while_first_holds() {
        let (repo, path) = setup();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();
        let exclusion = Exclusion::new(None);

        let ClaimOutcome::Claimed(token) = exclusion.claim(&a, &path).unwrap() else {
            panic!("first claim should win");
        };
        assert_eq!(exclusion.claim(&b, &path).unwrap(), ClaimOutcome::ClaimFailed);

        exclusion.release(&a, &token).unwrap();
        assert!(matches!(exclusion.claim(&b, &path).unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[test]
    fn finished_records_are_not_claimed() {
        let (repo, path) = setup();
        let s = repo.login().unwrap();
        let exclusion = Exclusion::new(None);

        let ClaimOutcome::Claimed(token) = exclusion.claim(&s, &path).unwrap() else {
            panic!("claim should win");
        };
        exclusion.finish(&s, &token, Utc::now()).unwrap();

        assert_eq!(exclusion.claim(&s, &path).unwrap(), ClaimOutcome::NotActive);
        let record = s.get(&path).unwrap().unwrap();
        assert!(!record.is_locked());
        assert!(record.date(PROPERTY_FINISHED).is_some());
    }

    #[test]
    fn transfer_lets_another_session_finish() {
        let (repo, path) = setup();
        let worker = repo.login().unwrap();
        let callback = repo.login().unwrap();
        let exclusion = Exclusion::new(None);

        let ClaimOutcome::Claimed(token) = exclusion.claim(&worker, &path).unwrap() else {
            panic!("claim should win");
        };
        assert_eq!(exclusion.held_count(), 1);

        let moved = exclusion.transfer(&token, &worker, &callback).unwrap();
        assert_eq!(moved.session(), callback.id());
        assert_eq!(exclusion.held_count(), 0);
        exclusion.finish(&callback, &moved, Utc::now()).unwrap();
    }

    fn job(s: &impl Session, path: &RecordPath, creator: ProcessId, active: bool) {
        let mut props = codec::write(&job_request("t", "j"), creator, Utc::now()).unwrap();
        props.insert(PROPERTY_ACTIVE.into(), Value::Boolean(active));
        s.create(path, props, None).unwrap();
    }

    #[test]
    fn finished_and_own_records_are_replaceable() {
        let (repo, _) = setup();
        let s = repo.login().unwrap();
        let me = ProcessId::new();
        let exclusion = Exclusion::new(None);

        let finished = RecordPath::new("/jobs/done").unwrap();
        job(&s, &finished, ProcessId::new(), false);
        assert_eq!(exclusion.remove_replaceable(&s, &finished, me).unwrap(), Replacement::Vacant);
        assert!(!s.exists(&finished).unwrap());

        let own = RecordPath::new("/jobs/mine").unwrap();
        job(&s, &own, me, true);
        assert_eq!(exclusion.remove_replaceable(&s, &own, me).unwrap(), Replacement::Vacant);
        assert!(!s.exists(&own).unwrap());

        let missing = RecordPath::new("/jobs/none").unwrap();
        assert_eq!(exclusion.remove_replaceable(&s, &missing, me).unwrap(), Replacement::Vacant);
    }

    #[test]
    fn record_replaced_by_a_peer_survives() {
        let (repo, _) = setup();
        let me = repo.login().unwrap();
        let peer = repo.login().unwrap();
        let peer_id = ProcessId::new();
        let exclusion = Exclusion::new(None);
        let path = RecordPath::new("/jobs/t j").unwrap();
        job(&me, &path, ProcessId::new(), false);

        // Seen as finished here, then replaced by the peer before removal.
        assert!(!is_active(&me.get(&path).unwrap().unwrap()));
        peer.remove(&path).unwrap();
        job(&peer, &path, peer_id, true);

        assert_eq!(
            exclusion.remove_replaceable(&me, &path, ProcessId::new()).unwrap(),
            Replacement::Kept
        );
        let record = peer.get(&path).unwrap().unwrap();
        assert!(is_active(&record));
        assert!(!record.is_locked());
        assert!(JobRecord::from_record(&record).created_by(peer_id));
    }

    #[test]
    fn held_record_is_not_replaced() {
        let (repo, _) = setup();
        let me = repo.login().unwrap();
        let peer = repo.login().unwrap();
        let exclusion = Exclusion::new(None);
        let path = RecordPath::new("/jobs/done").unwrap();
        job(&peer, &path, ProcessId::new(), false);
        peer.lock(&path, LockOptions::default()).unwrap();

        assert_eq!(
            exclusion.remove_replaceable(&me, &path, ProcessId::new()).unwrap(),
            Replacement::Busy
        );
        assert!(me.exists(&path).unwrap());
    }

    #[test]
    fn keeper_drops_locks_it_cannot_renew() {
        let (repo, path) = setup();
        let s = repo.login().unwrap();
        let exclusion = Exclusion::new(Some(Duration::from_millis(500)));

        let ClaimOutcome::Claimed(token) = exclusion.claim(&s, &path).unwrap() else {
            panic!("claim should win");
        };
        assert_eq!(exclusion.renew_held(&s), 1);

        s.unlock(token.path()).unwrap();
        assert_eq!(exclusion.renew_held(&s), 0);
        assert_eq!(exclusion.held_count(), 0);
    }
}
