//! Job consumers: topic-specific business logic plugged into the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use jobmesh_events::job::PROPERTY_JOB_RETRY_DELAY;
use jobmesh_events::{Event, finished_job, job_id, job_topic};

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// Try again, within the job's retry budget.
    Failure(String),
    /// Give up without retrying.
    Cancelled(String),
    /// Try again once `Duration` has passed.
    RetryAfter(Duration),
}

impl JobResult {
    pub fn reschedule(&self) -> bool {
        matches!(self, JobResult::Failure(_) | JobResult::RetryAfter(_))
    }
}

pub trait JobConsumer: Send + Sync {
    fn process(&self, job: &Event) -> JobResult;
}

impl<F> JobConsumer for F
where
    F: Fn(&Event) -> JobResult + Send + Sync,
{
    fn process(&self, job: &Event) -> JobResult {
        self(job)
    }
}

/// Consumers keyed by job topic.
///
/// Lookup tries the exact topic, then `prefix/*` patterns, then `*`.
#[derive(Default, Clone)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn JobConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(&mut self, pattern: impl Into<String>, consumer: C)
    where
        C: JobConsumer + 'static,
    {
        self.consumers.insert(pattern.into(), Arc::new(consumer));
    }

    pub fn with<C>(mut self, pattern: impl Into<String>, consumer: C) -> Self
    where
        C: JobConsumer + 'static,
    {
        self.register(pattern, consumer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn lookup(&self, topic: &str) -> Option<Arc<dyn JobConsumer>> {
        if let Some(c) = self.consumers.get(topic) {
            return Some(Arc::clone(c));
        }

        // Longest matching category wins, so "a/b/*" beats "a/*".
        let category = self
            .consumers
            .iter()
            .filter_map(|(pattern, consumer)| {
                let prefix = pattern.strip_suffix("/*")?;
                let rest = topic.strip_prefix(prefix)?;
                rest.starts_with('/').then_some((prefix.len(), consumer))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, c)) = category {
            return Some(Arc::clone(c));
        }

        self.consumers.get("*").map(Arc::clone)
    }

    /// Run the consumer for a delivered job and report the outcome through
    /// its completion context. Returns `false` when no consumer matched (the
    /// job is left for whoever else listens on the bus).
    pub fn dispatch(&self, job: &Event) -> bool {
        let Some(consumer) = self.lookup(job.topic()) else {
            return false;
        };
        let result = consumer.process(job);
        report(job, &result);
        true
    }

    fn len(&self) -> usize {
        self.consumers.len()
    }
}

impl core::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("consumers", &self.len())
            .finish()
    }
}

fn report(job: &Event, result: &JobResult) {
    let topic = job_topic(job).unwrap_or(job.topic());
    let id = job_id(job).unwrap_or_default();
    let accepted = match result {
        JobResult::Success => {
            debug!(job_topic = topic, job_id = id, "job succeeded");
            finished_job(job, false)
        }
        JobResult::Cancelled(reason) => {
            info!(job_topic = topic, job_id = id, reason = %reason, "job cancelled");
            finished_job(job, false)
        }
        JobResult::Failure(error) => {
            warn!(job_topic = topic, job_id = id, error = %error, "job failed; rescheduling");
            finished_job(job, true)
        }
        JobResult::RetryAfter(delay) => {
            let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let mut retry = job.clone();
            retry.set_property(PROPERTY_JOB_RETRY_DELAY, ms);
            finished_job(&retry, true)
        }
    };
    if !accepted && result.reschedule() {
        warn!(job_topic = topic, job_id = id, "job will not be retried");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use jobmesh_events::{JobStatusNotifier, NotifierContext, Properties};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(bool, Option<i64>)>>,
    }

    impl JobStatusNotifier for Recorder {
        fn finished_job(&self, job: &Event, reschedule: bool) -> bool {
            let delay = job.property(PROPERTY_JOB_RETRY_DELAY).and_then(|v| v.as_long());
            self.calls.lock().unwrap().push((reschedule, delay));
            true
        }
    }

    fn delivered(topic: &str, recorder: &Arc<Recorder>) -> Event {
        Event::new(topic, Properties::new()).with_completion(NotifierContext::new(recorder.clone()))
    }

    #[test]
    fn exact_then_category_then_wildcard() {
        let registry = ConsumerRegistry::new()
            .with("reports/daily", |_: &Event| JobResult::Success)
            .with("reports/*", |_: &Event| JobResult::Cancelled("category".into()))
            .with("*", |_: &Event| JobResult::Failure("wildcard".into()));

        let sample = Event::new("x", Properties::new());
        let run = |topic: &str| registry.lookup(topic).unwrap().process(&sample);
        assert_eq!(run("reports/daily"), JobResult::Success);
        assert_eq!(run("reports/weekly"), JobResult::Cancelled("category".into()));
        assert_eq!(run("reportsx/weekly"), JobResult::Failure("wildcard".into()));
    }

    #[test]
    fn no_match_without_wildcard() {
        let registry = ConsumerRegistry::new().with("a/*", |_: &Event| JobResult::Success);
        assert!(registry.lookup("b/c").is_none());
        assert!(!registry.dispatch(&Event::new("b/c", Properties::new())));
    }

    #[test]
    fn results_map_to_completion_calls() {
        let recorder = Arc::new(Recorder::default());
        let registry = ConsumerRegistry::new()
            .with("ok", |_: &Event| JobResult::Success)
            .with("fail", |_: &Event| JobResult::Failure("boom".into()))
            .with("later", |_: &Event| JobResult::RetryAfter(Duration::from_millis(1500)));

        assert!(registry.dispatch(&delivered("ok", &recorder)));
        assert!(registry.dispatch(&delivered("fail", &recorder)));
        assert!(registry.dispatch(&delivered("later", &recorder)));

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec![(false, None), (true, None), (true, Some(1500))]
        );
    }
}
