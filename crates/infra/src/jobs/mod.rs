//! Cluster-coordinated job dispatch.
//!
//! ## Design
//!
//! - Job requests are persisted as records in the shared store, one per
//!   `(job topic, job id)`
//! - A record is executed only by the member holding its lock
//! - Serial jobs run one at a time per member; parallel jobs run at once
//! - Rescheduled jobs keep their record and go back to the queue, bounded by
//!   a retry budget
//! - Crashed members' jobs are picked up through lock-release notifications,
//!   startup recovery and the periodic rescan
//!
//! ## Components
//!
//! - `codec`: event <-> record conversion
//! - `queue`: the local dispatch queue
//! - `exclusion`: claim / release / transfer / finish on record locks
//! - `policy`: serial vs parallel, the in-flight flag, retry accounting
//! - `recovery`, `cleanup`, `listener`: the store-driven loops
//! - `handler`: the engine tying them together
//! - `consumer`: topic-specific processing plugged in from outside

pub mod cleanup;
pub mod codec;
pub mod consumer;
pub mod exclusion;
pub mod handler;
pub mod listener;
pub mod policy;
pub mod queue;
pub mod recovery;

pub use cleanup::{Cleanup, CleanupReport};
pub use codec::{DecodeError, EncodeError, JobRecord};
pub use consumer::{ConsumerRegistry, JobConsumer, JobResult};
pub use exclusion::{ClaimOutcome, Exclusion, Replacement};
pub use handler::JobEventHandler;
pub use listener::OwnReleases;
pub use policy::{ExecutionMode, InFlightFlag, RetryDecision};
pub use queue::{DispatchQueue, JobInfo};
