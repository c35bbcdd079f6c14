//! In-process repository.
//!
//! Clones share the same tree, so several engines built on clones of one
//! `MemoryRepository` behave like members of one cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use jobmesh_core::{RecordPath, SessionId};

use crate::change::{ChangeEvent, ChangeKind, ChangeSubscription};
use crate::error::StoreError;
use crate::lock::{LockOptions, LockToken};
use crate::query::Query;
use crate::repository::{Repository, Session};
use crate::value::{LockInfo, Properties, Record};

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    holder: Option<SessionId>,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    session_scoped: bool,
    timeout: Option<Duration>,
}

impl LockEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn info(&self) -> LockInfo {
        LockInfo {
            holder: self.holder,
            acquired_at: self.acquired_at,
            expires_at: self.expires_at,
            session_scoped: self.session_scoped,
        }
    }
}

/// A timeout past the calendar range never lapses.
fn expiry(now: DateTime<Utc>, timeout: Option<Duration>) -> Option<DateTime<Utc>> {
    let timeout = chrono::Duration::from_std(timeout?).ok()?;
    now.checked_add_signed(timeout)
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<RecordPath, Properties>,
    locks: HashMap<RecordPath, LockEntry>,
}

impl State {
    fn live_lock(&mut self, path: &RecordPath, now: DateTime<Utc>) -> Option<&mut LockEntry> {
        if self.locks.get(path).is_some_and(|l| !l.is_live(now)) {
            self.locks.remove(path);
        }
        self.locks.get_mut(path)
    }

    fn snapshot(&self, path: &RecordPath, now: DateTime<Utc>) -> Option<Record> {
        self.nodes.get(path).map(|properties| Record {
            path: path.clone(),
            properties: properties.clone(),
            lock: self
                .locks
                .get(path)
                .filter(|l| l.is_live(now))
                .map(LockEntry::info),
        })
    }

    fn require_node(&self, path: &RecordPath) -> Result<(), StoreError> {
        if self.nodes.contains_key(path) {
            Ok(())
        } else {
            Err(StoreError::NotFound(path.clone()))
        }
    }

    fn check_writable(
        &mut self,
        path: &RecordPath,
        session: SessionId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.live_lock(path, now) {
            Some(lock) if lock.holder != Some(session) => Err(StoreError::Locked(path.clone())),
            _ => Ok(()),
        }
    }

    fn new_lock(&mut self, path: &RecordPath, session: SessionId, options: LockOptions, now: DateTime<Utc>) -> LockToken {
        let token = Uuid::now_v7().to_string();
        self.locks.insert(
            path.clone(),
            LockEntry {
                token: token.clone(),
                holder: Some(session),
                acquired_at: now,
                expires_at: expiry(now, options.timeout),
                session_scoped: options.session_scoped,
                timeout: options.timeout,
            },
        );
        LockToken::new(path.clone(), token, session)
    }

    fn release_session(&mut self, session: SessionId) -> Vec<ChangeEvent> {
        let released: Vec<RecordPath> = self
            .locks
            .iter()
            .filter(|(_, l)| l.session_scoped && l.holder == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        released
            .into_iter()
            .map(|path| {
                self.locks.remove(&path);
                ChangeEvent::node(ChangeKind::LockReleased, path, session)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Observer {
    root: RecordPath,
    sender: Sender<ChangeEvent>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    observers: Mutex<Vec<Observer>>,
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::poisoned())
    }

    fn publish(&self, changes: Vec<ChangeEvent>) {
        if changes.is_empty() {
            return;
        }
        let Ok(mut observers) = self.observers.lock() else {
            warn!("change observers lock poisoned; dropping notifications");
            return;
        };
        observers.retain(|observer| {
            changes
                .iter()
                .filter(|c| c.path.is_within(&observer.root))
                .all(|c| observer.sender.send(c.clone()).is_ok())
        });
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(RecordPath::root(), Properties::new());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    nodes,
                    locks: HashMap::new(),
                }),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryRepository {
    type Session = MemorySession;

    fn login(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            id: SessionId::new(),
            inner: Arc::clone(&self.inner),
        })
    }

    fn observe(&self, root: &RecordPath) -> Result<ChangeSubscription, StoreError> {
        let (sender, receiver) = mpsc::channel();
        self.inner
            .observers
            .lock()
            .map_err(|_| StoreError::poisoned())?
            .push(Observer {
                root: root.clone(),
                sender,
            });
        Ok(ChangeSubscription::new(receiver))
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    inner: Arc<Inner>,
}

impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn exists(&self, path: &RecordPath) -> Result<bool, StoreError> {
        Ok(self.inner.state()?.nodes.contains_key(path))
    }

    fn get(&self, path: &RecordPath) -> Result<Option<Record>, StoreError> {
        Ok(self.inner.state()?.snapshot(path, Utc::now()))
    }

    fn ensure_path(&self, path: &RecordPath) -> Result<(), StoreError> {
        let mut state = self.inner.state()?;
        for p in path.ancestors().into_iter().chain(std::iter::once(path.clone())) {
            state.nodes.entry(p).or_default();
        }
        Ok(())
    }

    fn create(
        &self,
        path: &RecordPath,
        properties: Properties,
        lock: Option<LockOptions>,
    ) -> Result<Option<LockToken>, StoreError> {
        let now = Utc::now();
        let changes: Vec<ChangeEvent> = properties
            .keys()
            .map(|name| ChangeEvent::property(ChangeKind::PropertyAdded, path.clone(), name, self.id))
            .collect();

        let token = {
            let mut state = self.inner.state()?;
            let parent = path
                .parent()
                .ok_or_else(|| StoreError::AlreadyExists(path.clone()))?;
            state.require_node(&parent)?;
            if state.nodes.contains_key(path) {
                return Err(StoreError::AlreadyExists(path.clone()));
            }
            state.nodes.insert(path.clone(), properties);
            // A stale lock entry may survive an expired record; the new one replaces it.
            state.locks.remove(path);
            lock.map(|options| state.new_lock(path, self.id, options, now))
        };

        self.inner.publish(changes);
        Ok(token)
    }

    fn set_properties(&self, path: &RecordPath, properties: Properties) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut changes = Vec::new();
        {
            let mut state = self.inner.state()?;
            state.require_node(path)?;
            state.check_writable(path, self.id, now)?;
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.clone()))?;
            for (name, value) in properties {
                let kind = match node.insert(name.clone(), value.clone()) {
                    None => Some(ChangeKind::PropertyAdded),
                    Some(old) if old != value => Some(ChangeKind::PropertyChanged),
                    Some(_) => None,
                };
                if let Some(kind) = kind {
                    changes.push(ChangeEvent::property(kind, path.clone(), name, self.id));
                }
            }
        }
        self.inner.publish(changes);
        Ok(())
    }

    fn remove(&self, path: &RecordPath) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::Storage("the root record cannot be removed".to_string()));
        }
        let now = Utc::now();
        {
            let mut state = self.inner.state()?;
            state.require_node(path)?;
            state.check_writable(path, self.id, now)?;
            state.nodes.retain(|p, _| !p.is_within(path));
            state.locks.retain(|p, _| !p.is_within(path));
        }
        self.inner
            .publish(vec![ChangeEvent::node(ChangeKind::NodeRemoved, path.clone(), self.id)]);
        Ok(())
    }

    fn lock(&self, path: &RecordPath, options: LockOptions) -> Result<LockToken, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state()?;
        state.require_node(path)?;
        if state.live_lock(path, now).is_some() {
            return Err(StoreError::Locked(path.clone()));
        }
        Ok(state.new_lock(path, self.id, options, now))
    }

    fn refresh_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state()?;
        match state.live_lock(token.path(), now) {
            Some(lock) if lock.token == token.token() && lock.holder == Some(self.id) => {
                lock.expires_at = expiry(now, lock.timeout);
                Ok(())
            }
            _ => Err(StoreError::LockNotHeld(token.path().clone())),
        }
    }

    fn unlock(&self, path: &RecordPath) -> Result<(), StoreError> {
        let now = Utc::now();
        {
            let mut state = self.inner.state()?;
            match state.live_lock(path, now).map(|lock| lock.holder) {
                None => return Err(StoreError::NotLocked(path.clone())),
                Some(holder) if holder != Some(self.id) => {
                    return Err(StoreError::LockNotHeld(path.clone()));
                }
                Some(_) => {
                    state.locks.remove(path);
                }
            }
        }
        self.inner
            .publish(vec![ChangeEvent::node(ChangeKind::LockReleased, path.clone(), self.id)]);
        Ok(())
    }

    fn add_lock_token(&self, token: &LockToken) -> Result<LockToken, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state()?;
        match state.live_lock(token.path(), now) {
            None => Err(StoreError::NotLocked(token.path().clone())),
            Some(lock) if lock.token != token.token() => Err(StoreError::LockNotHeld(token.path().clone())),
            Some(lock) => match lock.holder {
                Some(holder) if holder != self.id => Err(StoreError::Locked(token.path().clone())),
                _ => {
                    lock.holder = Some(self.id);
                    Ok(token.reissued(self.id))
                }
            },
        }
    }

    fn remove_lock_token(&self, token: &LockToken) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.inner.state()?;
        match state.live_lock(token.path(), now) {
            Some(lock) if lock.token == token.token() && lock.holder == Some(self.id) => {
                lock.holder = None;
                Ok(())
            }
            _ => Err(StoreError::LockNotHeld(token.path().clone())),
        }
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let now = Utc::now();
        let state = self.inner.state()?;
        Ok(state
            .nodes
            .range(query.root().clone()..)
            .map(|(path, _)| path)
            .filter(|path| path.is_descendant_of(query.root()))
            .filter_map(|path| state.snapshot(path, now))
            .filter(|record| query.matches(record))
            .collect())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let released = match self.inner.state() {
            Ok(mut state) => state.release_session(self.id),
            Err(_) => return,
        };
        self.inner.publish(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn path(p: &str) -> RecordPath {
        RecordPath::new(p).unwrap()
    }

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn repo_with_root() -> MemoryRepository {
        let repo = MemoryRepository::new();
        repo.login().unwrap().ensure_path(&path("/jobs")).unwrap();
        repo
    }

    #[test]
    fn create_requires_parent_and_rejects_duplicates() {
        let repo = repo_with_root();
        let s = repo.login().unwrap();

        assert!(matches!(
            s.create(&path("/nowhere/a"), Properties::new(), None),
            Err(StoreError::NotFound(_))
        ));
        s.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        assert!(matches!(
            s.create(&path("/jobs/a"), Properties::new(), None),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn create_with_lock_is_locked_from_the_start() {
        let repo = repo_with_root();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();

        let token = a
            .create(&path("/jobs/a"), props(&[("k", Value::from("v"))]), Some(LockOptions::default()))
            .unwrap()
            .unwrap();
        assert_eq!(token.session(), a.id());
        assert!(b.get(&path("/jobs/a")).unwrap().unwrap().is_locked());
        assert!(matches!(
            b.lock(&path("/jobs/a"), LockOptions::default()),
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(
            b.set_properties(&path("/jobs/a"), props(&[("k", Value::from("x"))])),
            Err(StoreError::Locked(_))
        ));
        assert!(matches!(b.remove(&path("/jobs/a")), Err(StoreError::Locked(_))));
    }

    #[test]
    fn only_the_holder_unlocks() {
        let repo = repo_with_root();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();
        a.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        a.lock(&path("/jobs/a"), LockOptions::default()).unwrap();

        assert!(matches!(b.unlock(&path("/jobs/a")), Err(StoreError::LockNotHeld(_))));
        a.unlock(&path("/jobs/a")).unwrap();
        assert!(matches!(a.unlock(&path("/jobs/a")), Err(StoreError::NotLocked(_))));
    }

    #[test]
    fn token_transfer_moves_ownership() {
        let repo = repo_with_root();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();
        a.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        let token = a.lock(&path("/jobs/a"), LockOptions::default()).unwrap();

        assert!(matches!(b.add_lock_token(&token), Err(StoreError::Locked(_))));
        a.remove_lock_token(&token).unwrap();
        let moved = b.add_lock_token(&token).unwrap();
        assert_eq!(moved.session(), b.id());
        assert_eq!(moved.token(), token.token());

        assert!(matches!(a.unlock(&path("/jobs/a")), Err(StoreError::LockNotHeld(_))));
        b.unlock(&path("/jobs/a")).unwrap();
    }

    #[test]
    fn dropping_a_session_releases_its_scoped_locks() {
        let repo = repo_with_root();
        let changes = repo.observe(&path("/jobs")).unwrap();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();
        a.create(&path("/jobs/a"), Properties::new(), Some(LockOptions::default()))
            .unwrap();

        drop(a);

        let released = changes.try_recv().unwrap();
        assert_eq!(released.kind, ChangeKind::LockReleased);
        assert_eq!(released.path, path("/jobs/a"));
        b.lock(&path("/jobs/a"), LockOptions::default()).unwrap();
    }

    #[test]
    fn timed_locks_lapse_unless_refreshed() {
        let repo = repo_with_root();
        let a = repo.login().unwrap();
        let b = repo.login().unwrap();
        a.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        let options = LockOptions::default().with_timeout(Some(Duration::from_millis(30)));
        let token = a.lock(&path("/jobs/a"), options).unwrap();

        std::thread::sleep(Duration::from_millis(15));
        a.refresh_lock(&token).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.get(&path("/jobs/a")).unwrap().unwrap().is_locked());

        std::thread::sleep(Duration::from_millis(40));
        assert!(!b.get(&path("/jobs/a")).unwrap().unwrap().is_locked());
        assert!(matches!(a.refresh_lock(&token), Err(StoreError::LockNotHeld(_))));
        b.lock(&path("/jobs/a"), LockOptions::default()).unwrap();
    }

    #[test]
    fn oversized_lock_timeout_never_lapses() {
        let repo = repo_with_root();
        let a = repo.login().unwrap();
        a.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        let options = LockOptions::default().with_timeout(Some(Duration::from_secs(u64::MAX / 4)));

        let token = a.lock(&path("/jobs/a"), options).unwrap();
        a.refresh_lock(&token).unwrap();
        let lock = a.get(&path("/jobs/a")).unwrap().unwrap().lock.unwrap();
        assert_eq!(lock.expires_at, None);
    }

    #[test]
    fn set_properties_reports_only_real_changes() {
        let repo = repo_with_root();
        let s = repo.login().unwrap();
        s.create(&path("/jobs/a"), props(&[("active", Value::Boolean(true))]), None)
            .unwrap();
        let changes = repo.observe(&path("/jobs")).unwrap();

        s.set_properties(
            &path("/jobs/a"),
            props(&[("active", Value::Boolean(true)), ("n", Value::Long(1))]),
        )
        .unwrap();
        let first = changes.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::PropertyAdded);
        assert_eq!(first.property.as_deref(), Some("n"));
        assert!(changes.try_recv().is_err());

        s.set_properties(&path("/jobs/a"), props(&[("active", Value::Boolean(false))]))
            .unwrap();
        assert!(changes.try_recv().unwrap().touches("active"));
    }

    #[test]
    fn observers_only_see_their_subtree() {
        let repo = repo_with_root();
        let s = repo.login().unwrap();
        s.ensure_path(&path("/other")).unwrap();
        let changes = repo.observe(&path("/jobs")).unwrap();

        s.create(&path("/other/x"), props(&[("k", Value::Long(1))]), None)
            .unwrap();
        assert!(changes.try_recv().is_err());

        s.create(&path("/jobs/x"), props(&[("k", Value::Long(1))]), None)
            .unwrap();
        let seen = changes.try_recv().unwrap();
        assert_eq!(seen.path, path("/jobs/x"));
        assert_eq!(seen.session, s.id());
    }

    #[test]
    fn query_filters_by_properties_and_lock_state() {
        let repo = repo_with_root();
        let s = repo.login().unwrap();
        s.create(&path("/jobs/a"), props(&[("active", Value::Boolean(true))]), None)
            .unwrap();
        s.create(&path("/jobs/b"), props(&[("active", Value::Boolean(true))]), Some(LockOptions::default()))
            .unwrap();
        s.create(&path("/jobs/c"), props(&[("active", Value::Boolean(false))]), None)
            .unwrap();

        let unlocked = s
            .query(&Query::under(path("/jobs")).eq("active", true).locked(false))
            .unwrap();
        assert_eq!(unlocked.len(), 1);
        assert_eq!(unlocked[0].path, path("/jobs/a"));

        let all = s.query(&Query::under(path("/jobs"))).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn remove_drops_the_subtree_and_notifies() {
        let repo = repo_with_root();
        let s = repo.login().unwrap();
        s.create(&path("/jobs/a"), Properties::new(), None).unwrap();
        let changes = repo.observe(&path("/jobs")).unwrap();

        s.remove(&path("/jobs/a")).unwrap();
        assert!(!s.exists(&path("/jobs/a")).unwrap());
        assert_eq!(changes.try_recv().unwrap().kind, ChangeKind::NodeRemoved);
        assert!(matches!(s.remove(&path("/jobs/a")), Err(StoreError::NotFound(_))));
    }
}
