//! Job event conventions and the completion-callback contract.
//!
//! A job is requested by publishing an event on [`TOPIC_JOB`] carrying at least
//! [`PROPERTY_JOB_TOPIC`] and [`PROPERTY_JOB_ID`]. The engine persists it, claims
//! it cluster-wide, and re-publishes it on the job topic with a
//! [`NotifierContext`] attached. Whoever processes the job must report back
//! exactly once through [`finished_job`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::event::{Event, Properties, PropertyValue};

/// Topic of inbound "run this job" events.
pub const TOPIC_JOB: &str = "jobmesh/job";

/// Topic the job is delivered on (routing key for consumers).
pub const PROPERTY_JOB_TOPIC: &str = "event.job.topic";

/// Caller-supplied uniqueness key of the job.
pub const PROPERTY_JOB_ID: &str = "event.job.id";

/// Presence marks the job as parallel-safe.
pub const PROPERTY_JOB_PARALLEL: &str = "event.job.parallelprocessing";

/// Retry budget of the job (`-1` = unlimited).
pub const PROPERTY_JOB_RETRIES: &str = "event.job.retries";

/// Number of reschedules so far.
pub const PROPERTY_JOB_RETRY_COUNT: &str = "event.job.retrycount";

/// Delay in milliseconds before a rescheduled job is re-queued.
pub const PROPERTY_JOB_RETRY_DELAY: &str = "event.job.retrydelay";

/// Origin marker: set on events that came from another cluster member.
pub const PROPERTY_APPLICATION: &str = "event.application";

/// Transport hint of the local bus; never persisted.
pub const PROPERTY_DISTRIBUTE: &str = "event.distribute";

/// Properties that only make sense inside one process and are never persisted.
pub const TRANSPORT_ONLY_PROPERTIES: [&str; 2] = [PROPERTY_APPLICATION, PROPERTY_DISTRIBUTE];

/// Build an inbound job request for `job_topic` / `job_id`.
pub fn job_request(job_topic: impl Into<String>, job_id: impl Into<String>) -> Event {
    Event::new(TOPIC_JOB, Properties::new())
        .with_property(PROPERTY_JOB_TOPIC, job_topic.into())
        .with_property(PROPERTY_JOB_ID, job_id.into())
}

pub fn job_topic(event: &Event) -> Option<&str> {
    event.property_str(PROPERTY_JOB_TOPIC)
}

pub fn job_id(event: &Event) -> Option<&str> {
    event.property_str(PROPERTY_JOB_ID)
}

/// A job is parallel-safe when the parallel property is present, unless it is
/// an explicit `false`.
pub fn is_parallel(event: &Event) -> bool {
    match event.property(PROPERTY_JOB_PARALLEL) {
        None => false,
        Some(PropertyValue::Boolean(b)) => *b,
        Some(_) => true,
    }
}

/// Events stamped with an application id were forwarded from another member.
pub fn is_local(event: &Event) -> bool {
    event.property(PROPERTY_APPLICATION).is_none()
}

/// Receives the outcome of one execution attempt.
pub trait JobStatusNotifier: Send + Sync {
    /// Report that processing of `job` ended.
    ///
    /// `reschedule = true` asks for another attempt. Returns `false` when the
    /// request could not be honoured (retries exhausted, store failure).
    fn finished_job(&self, job: &Event, reschedule: bool) -> bool;
}

/// Local-only completion context attached to a delivered job.
///
/// Clones share the same once-flag: whichever copy reports first wins.
#[derive(Clone)]
pub struct NotifierContext {
    notifier: Arc<dyn JobStatusNotifier>,
    reported: Arc<AtomicBool>,
}

impl NotifierContext {
    pub fn new(notifier: Arc<dyn JobStatusNotifier>) -> Self {
        Self {
            notifier,
            reported: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }

    /// Forward the outcome to the notifier; later calls are refused.
    pub fn report(&self, job: &Event, reschedule: bool) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            warn!(topic = job.topic(), "job completion reported more than once; ignoring");
            return false;
        }
        self.notifier.finished_job(job, reschedule)
    }
}

impl core::fmt::Debug for NotifierContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotifierContext")
            .field("reported", &self.is_reported())
            .finish()
    }
}

/// Report the end of an execution attempt for a delivered job.
///
/// Returns `false` when the event carries no completion context (it was not
/// delivered by the engine) or when the attempt was already reported.
pub fn finished_job(job: &Event, reschedule: bool) -> bool {
    match job.completion() {
        Some(context) => context.report(job, reschedule),
        None => {
            warn!(topic = job.topic(), "finished_job called for an event without completion context");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<bool>>,
    }

    impl JobStatusNotifier for Recorder {
        fn finished_job(&self, _job: &Event, reschedule: bool) -> bool {
            self.calls.lock().unwrap().push(reschedule);
            true
        }
    }

    #[test]
    fn job_request_carries_topic_and_id() {
        let ev = job_request("t1", "j1");
        assert_eq!(ev.topic(), TOPIC_JOB);
        assert_eq!(job_topic(&ev), Some("t1"));
        assert_eq!(job_id(&ev), Some("j1"));
        assert!(!is_parallel(&ev));
        assert!(is_local(&ev));
    }

    #[test]
    fn parallel_flag_follows_presence() {
        let ev = job_request("t", "j").with_property(PROPERTY_JOB_PARALLEL, "yes");
        assert!(is_parallel(&ev));
        let ev = job_request("t", "j").with_property(PROPERTY_JOB_PARALLEL, false);
        assert!(!is_parallel(&ev));
    }

    #[test]
    fn forwarded_events_are_not_local() {
        let ev = job_request("t", "j").with_property(PROPERTY_APPLICATION, "other");
        assert!(!is_local(&ev));
    }

    #[test]
    fn completion_is_reported_once() {
        let recorder = Arc::new(Recorder::default());
        let ev = Event::new("t", Properties::new())
            .with_completion(NotifierContext::new(recorder.clone()));
        let copy = ev.clone();

        assert!(finished_job(&ev, true));
        assert!(!finished_job(&copy, false));
        assert_eq!(*recorder.calls.lock().unwrap(), vec![true]);
    }

    #[test]
    fn missing_context_is_refused() {
        assert!(!finished_job(&job_request("t", "j"), false));
    }
}
