//! Shared hierarchical record store used for cluster-wide job coordination.
//!
//! The store is a tree of records addressed by absolute paths. Records carry
//! typed properties, can be locked exclusively by one session, can be queried
//! by property, and emit change notifications to observers of a subtree.
//!
//! `MemoryRepository` is the in-process implementation; `RedisRepository`
//! (feature `redis`) shares the tree between processes.

pub mod change;
pub mod error;
pub mod lock;
pub mod memory;
pub mod query;
pub mod repository;
pub mod value;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use change::{ChangeEvent, ChangeKind, ChangeSubscription};
pub use error::StoreError;
pub use lock::{LockOptions, LockToken};
pub use memory::{MemoryRepository, MemorySession};
pub use query::{Condition, Query};
pub use repository::{Repository, Session};
pub use value::{LockInfo, Properties, Record, Value};

#[cfg(feature = "redis")]
pub use redis_store::{RedisRepository, RedisSession};
