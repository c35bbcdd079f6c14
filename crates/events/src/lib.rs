//! `jobmesh-events`: local events, job conventions and the in-process bus.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod job;

pub use bus::{EventBus, Subscription};
pub use event::{Event, Properties, PropertyValue};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use job::{
    JobStatusNotifier, NotifierContext, TOPIC_JOB, finished_job, is_local, is_parallel, job_id,
    job_request, job_topic,
};
