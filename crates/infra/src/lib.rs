//! Infrastructure layer: configuration, identity, store sessions, the job
//! engine and its background workers.

pub mod config;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod session;
pub mod workers;

pub use config::{ConfigError, JobManagerConfig};
pub use error::JobManagerError;
pub use identity::{FileIdentity, IdentityProvider, StaticIdentity};
pub use jobs::{
    ConsumerRegistry, JobConsumer, JobEventHandler, JobResult,
};
pub use session::SessionManager;
pub use workers::{ConsumerWorker, WorkerHandle};
