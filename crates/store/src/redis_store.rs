//! Redis-backed repository (optional).
//!
//! Layout under a namespace `ns`:
//! - `ns:paths` set of every record path
//! - `ns:node:<path>` hash of property name to JSON-encoded value
//! - `ns:lock:<path>` JSON lock entry, with a PX expiry for timed locks
//! - `ns:changes` pub/sub channel carrying JSON change events
//!
//! Every conditional write is a Lua script so lock checks and mutations are
//! atomic on the server. Session-scoped locks are released when the session
//! is dropped; a process that dies without dropping its sessions leaves them
//! behind until their timeout, so deployments on Redis should configure a
//! lock timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{Commands, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use jobmesh_core::{RecordPath, SessionId};

use crate::change::{ChangeEvent, ChangeKind, ChangeSubscription};
use crate::error::StoreError;
use crate::lock::{LockOptions, LockToken};
use crate::query::Query;
use crate::repository::{Repository, Session};
use crate::value::{LockInfo, Properties, Record, Value};

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Storage(e.to_string())
        }
    }
}

const OBSERVER_POLL: Duration = Duration::from_millis(250);

const PRELUDE: &str = r#"
local ns = ARGV[1]
local paths_key = ns .. ':paths'
local function node_key(p) return ns .. ':node:' .. p end
local function lock_key(p) return ns .. ':lock:' .. p end
local function read_lock(p)
  local raw = redis.call('GET', lock_key(p))
  if not raw then return nil end
  return cjson.decode(raw)
end
local function write_lock(p, lock)
  local key = lock_key(p)
  local ttl = redis.call('PTTL', key)
  if ttl > 0 then
    redis.call('SET', key, cjson.encode(lock), 'PX', ttl)
  else
    redis.call('SET', key, cjson.encode(lock))
  end
end
"#;

// ARGV: ns, path, parent, lock json or '', px, name/value pairs...
const CREATE: &str = r#"
local path = ARGV[2]
if redis.call('SISMEMBER', paths_key, ARGV[3]) == 0 then return 'missing' end
if redis.call('SISMEMBER', paths_key, path) == 1 then return 'exists' end
redis.call('SADD', paths_key, path)
redis.call('DEL', lock_key(path))
for i = 6, #ARGV, 2 do
  redis.call('HSET', node_key(path), ARGV[i], ARGV[i + 1])
end
if ARGV[4] ~= '' then
  if tonumber(ARGV[5]) > 0 then
    redis.call('SET', lock_key(path), ARGV[4], 'PX', ARGV[5])
  else
    redis.call('SET', lock_key(path), ARGV[4])
  end
end
return 'ok'
"#;

// ARGV: ns, path, session, name/value pairs...
// Reply: status followed by `added:<name>` / `changed:<name>` entries.
const SET_PROPERTIES: &str = r#"
local path = ARGV[2]
if redis.call('SISMEMBER', paths_key, path) == 0 then return {'missing'} end
local lock = read_lock(path)
if lock and lock.holder ~= ARGV[3] then return {'locked'} end
local reply = {'ok'}
for i = 4, #ARGV, 2 do
  local old = redis.call('HGET', node_key(path), ARGV[i])
  if old ~= ARGV[i + 1] then
    redis.call('HSET', node_key(path), ARGV[i], ARGV[i + 1])
    if old then
      table.insert(reply, 'changed:' .. ARGV[i])
    else
      table.insert(reply, 'added:' .. ARGV[i])
    end
  end
end
return reply
"#;

// ARGV: ns, path, session
const REMOVE: &str = r#"
local path = ARGV[2]
if redis.call('SISMEMBER', paths_key, path) == 0 then return 'missing' end
local lock = read_lock(path)
if lock and lock.holder ~= ARGV[3] then return 'locked' end
local prefix = path .. '/'
for _, p in ipairs(redis.call('SMEMBERS', paths_key)) do
  if p == path or string.sub(p, 1, #prefix) == prefix then
    redis.call('SREM', paths_key, p)
    redis.call('DEL', node_key(p))
    redis.call('DEL', lock_key(p))
  end
end
return 'ok'
"#;

// ARGV: ns, path, lock json, px
const LOCK: &str = r#"
if redis.call('SISMEMBER', paths_key, ARGV[2]) == 0 then return 'missing' end
local ok
if tonumber(ARGV[4]) > 0 then
  ok = redis.call('SET', lock_key(ARGV[2]), ARGV[3], 'NX', 'PX', ARGV[4])
else
  ok = redis.call('SET', lock_key(ARGV[2]), ARGV[3], 'NX')
end
if ok then return 'ok' end
return 'locked'
"#;

// ARGV: ns, path, session
const UNLOCK: &str = r#"
local lock = read_lock(ARGV[2])
if not lock then return 'not_locked' end
if lock.holder ~= ARGV[3] then return 'not_held' end
redis.call('DEL', lock_key(ARGV[2]))
return 'ok'
"#;

// ARGV: ns, path, session
const RELEASE_SCOPED: &str = r#"
local lock = read_lock(ARGV[2])
if not lock or lock.holder ~= ARGV[3] or not lock.session_scoped then return 'not_held' end
redis.call('DEL', lock_key(ARGV[2]))
return 'ok'
"#;

// ARGV: ns, path, session, token
const REFRESH_LOCK: &str = r#"
local lock = read_lock(ARGV[2])
if not lock or lock.token ~= ARGV[4] or lock.holder ~= ARGV[3] then return 'not_held' end
if type(lock.timeout_ms) == 'number' then
  redis.call('PEXPIRE', lock_key(ARGV[2]), lock.timeout_ms)
end
return 'ok'
"#;

// ARGV: ns, path, session, token
const ADD_LOCK_TOKEN: &str = r#"
local lock = read_lock(ARGV[2])
if not lock then return 'not_locked' end
if lock.token ~= ARGV[4] then return 'not_held' end
if type(lock.holder) == 'string' and lock.holder ~= ARGV[3] then return 'locked' end
lock.holder = ARGV[3]
write_lock(ARGV[2], lock)
return 'ok'
"#;

// ARGV: ns, path, session, token
const REMOVE_LOCK_TOKEN: &str = r#"
local lock = read_lock(ARGV[2])
if not lock or lock.token ~= ARGV[4] or lock.holder ~= ARGV[3] then return 'not_held' end
lock.holder = cjson.null
write_lock(ARGV[2], lock)
return 'ok'
"#;

#[derive(Debug)]
struct Scripts {
    create: Script,
    set_properties: Script,
    remove: Script,
    lock: Script,
    unlock: Script,
    release_scoped: Script,
    refresh_lock: Script,
    add_lock_token: Script,
    remove_lock_token: Script,
}

impl Scripts {
    fn load() -> Self {
        let s = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            create: s(CREATE),
            set_properties: s(SET_PROPERTIES),
            remove: s(REMOVE),
            lock: s(LOCK),
            unlock: s(UNLOCK),
            release_scoped: s(RELEASE_SCOPED),
            refresh_lock: s(REFRESH_LOCK),
            add_lock_token: s(ADD_LOCK_TOKEN),
            remove_lock_token: s(REMOVE_LOCK_TOKEN),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockValue {
    token: String,
    holder: Option<SessionId>,
    session_scoped: bool,
    acquired_at: DateTime<Utc>,
    timeout_ms: Option<u64>,
}

impl LockValue {
    fn fresh(session: SessionId, options: LockOptions) -> Self {
        Self {
            token: Uuid::now_v7().to_string(),
            holder: Some(session),
            session_scoped: options.session_scoped,
            acquired_at: Utc::now(),
            timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
        }
    }

    fn px(&self) -> u64 {
        self.timeout_ms.unwrap_or(0)
    }
}

fn status(path: &RecordPath, reply: &str) -> Result<(), StoreError> {
    match reply {
        "ok" => Ok(()),
        "missing" => Err(StoreError::NotFound(path.clone())),
        "exists" => Err(StoreError::AlreadyExists(path.clone())),
        "locked" => Err(StoreError::Locked(path.clone())),
        "not_held" => Err(StoreError::LockNotHeld(path.clone())),
        "not_locked" => Err(StoreError::NotLocked(path.clone())),
        other => Err(StoreError::Storage(format!("unexpected script reply: {other}"))),
    }
}

fn encode_value(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Repository stored in a single Redis instance.
#[derive(Debug, Clone)]
pub struct RedisRepository {
    client: redis::Client,
    namespace: String,
    scripts: Arc<Scripts>,
}

impl RedisRepository {
    pub fn new(redis_url: impl AsRef<str>, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            scripts: Arc::new(Scripts::load()),
        })
    }

    fn channel(&self) -> String {
        format!("{}:changes", self.namespace)
    }
}

impl Repository for RedisRepository {
    type Session = RedisSession;

    fn login(&self) -> Result<RedisSession, StoreError> {
        let conn = self.client.get_connection()?;
        Ok(RedisSession {
            id: SessionId::new(),
            namespace: self.namespace.clone(),
            channel: self.channel(),
            scripts: Arc::clone(&self.scripts),
            conn: Mutex::new(conn),
            held: Mutex::new(HashSet::new()),
        })
    }

    fn observe(&self, root: &RecordPath) -> Result<ChangeSubscription, StoreError> {
        let (tx, rx) = mpsc::channel();
        let subscription = ChangeSubscription::new(rx);
        let closed = subscription.closed_flag();
        let conn = self.client.get_connection()?;
        let channel = self.channel();
        let root = root.clone();

        thread::Builder::new()
            .name("jobmesh-redis-observer".to_string())
            .spawn(move || run_observer(conn, &channel, &root, &tx, &closed))
            .map_err(|e| StoreError::Unavailable(format!("cannot start change observer: {e}")))?;
        Ok(subscription)
    }
}

/// Forward pub/sub change notifications under `root` until the subscription
/// is dropped or the connection fails.
fn run_observer(
    mut conn: redis::Connection,
    channel: &str,
    root: &RecordPath,
    tx: &mpsc::Sender<ChangeEvent>,
    closed: &AtomicBool,
) {
    let mut pubsub = conn.as_pubsub();
    if let Err(e) = pubsub.subscribe(channel) {
        warn!(error = %e, channel = %channel, "change subscription failed");
        return;
    }
    if let Err(e) = pubsub.set_read_timeout(Some(OBSERVER_POLL)) {
        warn!(error = %e, "cannot set change subscription timeout");
        return;
    }

    while !closed.load(Ordering::SeqCst) {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(error = %e, "change subscription closed");
                return;
            }
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let change: ChangeEvent = match serde_json::from_str(&payload) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "ignoring malformed change notification");
                continue;
            }
        };
        if change.path.is_within(root) && tx.send(change).is_err() {
            return;
        }
    }
    debug!(channel = %channel, "change subscription dropped");
}

/// One Redis connection with its own session identity.
pub struct RedisSession {
    id: SessionId,
    namespace: String,
    channel: String,
    scripts: Arc<Scripts>,
    conn: Mutex<redis::Connection>,
    held: Mutex<HashSet<RecordPath>>,
}

impl std::fmt::Debug for RedisSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSession")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisSession {
    fn conn(&self) -> Result<MutexGuard<'_, redis::Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::poisoned())
    }

    fn key(&self, kind: &str, path: &RecordPath) -> String {
        format!("{}:{kind}:{path}", self.namespace)
    }

    fn run<T: redis::FromRedisValue>(&self, script: &Script, args: &[String]) -> Result<T, StoreError> {
        let mut invocation = script.prepare_invoke();
        invocation.arg(&self.namespace);
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.conn()?;
        Ok(invocation.invoke(&mut *conn)?)
    }

    fn notify(&self, changes: &[ChangeEvent]) {
        if changes.is_empty() {
            return;
        }
        let Ok(mut conn) = self.conn() else {
            return;
        };
        for change in changes {
            let payload = match serde_json::to_string(change) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed to encode change notification");
                    continue;
                }
            };
            let sent: redis::RedisResult<i64> = conn.publish(&self.channel, payload);
            if let Err(e) = sent {
                warn!(error = %e, path = %change.path, "failed to publish change notification");
            }
        }
    }

    fn track(&self, path: &RecordPath, held: bool) {
        if let Ok(mut paths) = self.held.lock() {
            if held {
                paths.insert(path.clone());
            } else {
                paths.remove(path);
            }
        }
    }

    fn read(&self, conn: &mut redis::Connection, path: &RecordPath) -> Result<Option<Record>, StoreError> {
        let (present, fields, lock, ttl): (bool, HashMap<String, String>, Option<String>, i64) = redis::pipe()
            .sismember(format!("{}:paths", self.namespace), path.as_str())
            .hgetall(self.key("node", path))
            .get(self.key("lock", path))
            .pttl(self.key("lock", path))
            .query(conn)?;
        if !present {
            return Ok(None);
        }

        let mut properties = Properties::new();
        for (name, raw) in fields {
            let value: Value =
                serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
            properties.insert(name, value);
        }

        let lock = match lock {
            Some(raw) => {
                let value: LockValue =
                    serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
                Some(LockInfo {
                    holder: value.holder,
                    acquired_at: value.acquired_at,
                    expires_at: (ttl > 0).then(|| Utc::now() + chrono::Duration::milliseconds(ttl)),
                    session_scoped: value.session_scoped,
                })
            }
            None => None,
        };

        Ok(Some(Record {
            path: path.clone(),
            properties,
            lock,
        }))
    }

    fn token_args(&self, token: &LockToken) -> Vec<String> {
        vec![
            token.path().to_string(),
            self.id.to_string(),
            token.token().to_string(),
        ]
    }
}

impl Session for RedisSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn exists(&self, path: &RecordPath) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        Ok(conn.sismember(format!("{}:paths", self.namespace), path.as_str())?)
    }

    fn get(&self, path: &RecordPath) -> Result<Option<Record>, StoreError> {
        let mut conn = self.conn()?;
        self.read(&mut conn, path)
    }

    fn ensure_path(&self, path: &RecordPath) -> Result<(), StoreError> {
        let members: Vec<String> = path
            .ancestors()
            .into_iter()
            .chain(std::iter::once(path.clone()))
            .map(String::from)
            .collect();
        let mut conn = self.conn()?;
        let _: i64 = conn.sadd(format!("{}:paths", self.namespace), members)?;
        Ok(())
    }

    fn create(
        &self,
        path: &RecordPath,
        properties: Properties,
        lock: Option<LockOptions>,
    ) -> Result<Option<LockToken>, StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::AlreadyExists(path.clone()))?;
        let lock_value = lock.map(|options| LockValue::fresh(self.id, options));
        let lock_json = match &lock_value {
            Some(v) => serde_json::to_string(v).map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => String::new(),
        };

        let mut args = vec![
            path.to_string(),
            parent.to_string(),
            lock_json,
            lock_value.as_ref().map_or(0, LockValue::px).to_string(),
        ];
        for (name, value) in &properties {
            args.push(name.clone());
            args.push(encode_value(value)?);
        }

        let reply: String = self.run(&self.scripts.create, &args)?;
        match reply.as_str() {
            "missing" => return Err(StoreError::NotFound(parent)),
            other => status(path, other)?,
        }

        let changes: Vec<ChangeEvent> = properties
            .keys()
            .map(|name| ChangeEvent::property(ChangeKind::PropertyAdded, path.clone(), name, self.id))
            .collect();
        self.notify(&changes);

        Ok(lock_value.map(|v| {
            self.track(path, true);
            LockToken::new(path.clone(), v.token, self.id)
        }))
    }

    fn set_properties(&self, path: &RecordPath, properties: Properties) -> Result<(), StoreError> {
        let mut args = vec![path.to_string(), self.id.to_string()];
        for (name, value) in &properties {
            args.push(name.clone());
            args.push(encode_value(value)?);
        }

        let reply: Vec<String> = self.run(&self.scripts.set_properties, &args)?;
        let (head, entries) = reply
            .split_first()
            .ok_or_else(|| StoreError::Storage("empty script reply".to_string()))?;
        status(path, head)?;

        let changes: Vec<ChangeEvent> = entries
            .iter()
            .filter_map(|entry| {
                let (kind, name) = entry.split_once(':')?;
                let kind = match kind {
                    "added" => ChangeKind::PropertyAdded,
                    _ => ChangeKind::PropertyChanged,
                };
                Some(ChangeEvent::property(kind, path.clone(), name, self.id))
            })
            .collect();
        self.notify(&changes);
        Ok(())
    }

    fn remove(&self, path: &RecordPath) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::Storage("the root record cannot be removed".to_string()));
        }
        let reply: String = self.run(&self.scripts.remove, &[path.to_string(), self.id.to_string()])?;
        status(path, &reply)?;
        self.track(path, false);
        self.notify(&[ChangeEvent::node(ChangeKind::NodeRemoved, path.clone(), self.id)]);
        Ok(())
    }

    fn lock(&self, path: &RecordPath, options: LockOptions) -> Result<LockToken, StoreError> {
        let value = LockValue::fresh(self.id, options);
        let json = serde_json::to_string(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let reply: String = self.run(&self.scripts.lock, &[path.to_string(), json, value.px().to_string()])?;
        status(path, &reply)?;
        self.track(path, true);
        Ok(LockToken::new(path.clone(), value.token, self.id))
    }

    fn refresh_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        let reply: String = self.run(&self.scripts.refresh_lock, &self.token_args(token))?;
        status(token.path(), &reply)
    }

    fn unlock(&self, path: &RecordPath) -> Result<(), StoreError> {
        let reply: String = self.run(&self.scripts.unlock, &[path.to_string(), self.id.to_string()])?;
        status(path, &reply)?;
        self.track(path, false);
        self.notify(&[ChangeEvent::node(ChangeKind::LockReleased, path.clone(), self.id)]);
        Ok(())
    }

    fn add_lock_token(&self, token: &LockToken) -> Result<LockToken, StoreError> {
        let reply: String = self.run(&self.scripts.add_lock_token, &self.token_args(token))?;
        status(token.path(), &reply)?;
        self.track(token.path(), true);
        Ok(token.reissued(self.id))
    }

    fn remove_lock_token(&self, token: &LockToken) -> Result<(), StoreError> {
        let reply: String = self.run(&self.scripts.remove_lock_token, &self.token_args(token))?;
        status(token.path(), &reply)?;
        self.track(token.path(), false);
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let mut conn = self.conn()?;
        let paths: Vec<String> = conn.smembers(format!("{}:paths", self.namespace))?;
        let mut records = Vec::new();
        for raw in paths {
            let Ok(path) = RecordPath::new(&raw) else {
                continue;
            };
            if !path.is_descendant_of(query.root()) {
                continue;
            }
            if let Some(record) = self.read(&mut conn, &path)? {
                if query.matches(&record) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }
}

impl Drop for RedisSession {
    fn drop(&mut self) {
        let held: Vec<RecordPath> = match self.held.lock() {
            Ok(mut paths) => paths.drain().collect(),
            Err(_) => return,
        };
        let mut released = Vec::new();
        for path in held {
            match self.run::<String>(&self.scripts.release_scoped, &[path.to_string(), self.id.to_string()]) {
                Ok(reply) if reply == "ok" => {
                    released.push(ChangeEvent::node(ChangeKind::LockReleased, path, self.id));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, path = %path, "failed to release session lock"),
            }
        }
        self.notify(&released);
    }
}
