use std::io;
use std::sync::Arc;
use std::thread;

use tracing::{trace, warn};

use jobmesh_events::{Event, EventBus, is_parallel};

use super::{WorkerHandle, spawn_inbox_worker};
use crate::jobs::ConsumerRegistry;

/// Runs registered consumers for the jobs the engine delivers on the bus.
///
/// Only events carrying a completion context are considered. Serial jobs run
/// on the worker thread; parallel jobs get a thread of their own so they do
/// not hold up the next delivery.
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    pub fn spawn<B>(name: &str, bus: B, registry: ConsumerRegistry) -> io::Result<WorkerHandle>
    where
        B: EventBus<Event>,
    {
        let registry = Arc::new(registry);
        let worker = name.to_string();
        spawn_inbox_worker(name, bus.subscribe(), move |job: Event| {
            if job.completion().is_none() || registry.lookup(job.topic()).is_none() {
                trace!(worker = %worker, topic = job.topic(), "not a job for this worker");
                return;
            }
            if !is_parallel(&job) {
                registry.dispatch(&job);
                return;
            }

            let shared = Arc::clone(&registry);
            let (tx, rx) = std::sync::mpsc::channel::<Event>();
            let spawned = thread::Builder::new()
                .name(format!("{worker}-parallel"))
                .spawn(move || {
                    if let Ok(job) = rx.recv() {
                        shared.dispatch(&job);
                    }
                });
            match spawned {
                Ok(_) => {
                    let _ = tx.send(job);
                }
                Err(e) => {
                    warn!(worker = %worker, error = %e, "cannot spawn job thread; running inline");
                    registry.dispatch(&job);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use jobmesh_events::job::PROPERTY_JOB_PARALLEL;
    use jobmesh_events::{InMemoryEventBus, JobStatusNotifier, NotifierContext, Properties};

    use crate::jobs::JobResult;

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

    fn wait_for(recorder: &Recorder, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.calls.lock().unwrap().len() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivered_jobs_are_processed_and_reported() {
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let recorder = Arc::new(Recorder::default());
        let registry = ConsumerRegistry::new()
            .with("mail/*", |_: &Event| JobResult::Success)
            .with("flaky", |_: &Event| JobResult::Failure("nope".into()));
        let handle = ConsumerWorker::spawn("test-consumer", bus.clone(), registry).unwrap();

        let deliver = |topic: &str, parallel: bool| {
            let mut ev = Event::new(topic, Properties::new());
            if parallel {
                ev.set_property(PROPERTY_JOB_PARALLEL, true);
            }
            bus.publish(ev.with_completion(NotifierContext::new(recorder.clone())))
                .unwrap();
        };
        deliver("mail/send", false);
        deliver("flaky", true);
        // Not delivered by the engine: no completion context.
        bus.publish(Event::new("mail/send", Properties::new())).unwrap();

        wait_for(&recorder, 2);
        handle.shutdown();

        let mut calls = recorder.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![false, true]);
    }
}
