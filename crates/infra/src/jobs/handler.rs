//! The cluster job engine.
//!
//! One `JobEventHandler` runs per cluster member. It persists job requests as
//! records under the configured subtree, claims them through store locks,
//! hands claimed jobs to consumers on the event bus and settles the record
//! once the consumer reports back. Members never talk to each other directly:
//! the shared store and its change notifications are the only transport.
//!
//! Threads owned by the engine:
//!
//! - the dispatcher, draining the local queue (the only thread that claims)
//! - the bus worker, turning inbound job requests into queue items
//! - the change listener, queueing jobs released or written by other members
//! - the cleanup timer, purging finished records and rescanning for
//!   unclaimed ones
//! - the lock keeper, when locks have a timeout

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use jobmesh_core::{ProcessId, RecordPath};
use jobmesh_events::job::{PROPERTY_JOB_RETRIES, PROPERTY_JOB_RETRY_COUNT};
use jobmesh_events::{
    Event, EventBus, JobStatusNotifier, NotifierContext, Properties as EventProperties, TOPIC_JOB,
    is_local, job_id, job_topic,
};
use jobmesh_store::{ChangeEvent, LockToken, Properties, Query, Repository, Session, StoreError, Value};

use super::cleanup::Cleanup;
use super::codec::{self, JobRecord, PROPERTY_ACTIVE, PROPERTY_PROCESSOR, PROPERTY_TOPIC};
use super::exclusion::{ClaimOutcome, Exclusion, Replacement};
use super::listener::{self, OwnReleases};
use super::policy::{ExecutionMode, InFlightFlag, RetryDecision, retry_decision, should_back_off};
use super::queue::{self, DispatchQueue, JobInfo, QueueDrain, QueueItem};
use super::recovery;
use crate::config::JobManagerConfig;
use crate::error::JobManagerError;
use crate::identity::IdentityProvider;
use crate::session::SessionManager;
use crate::workers::{WorkerHandle, spawn_inbox_worker, spawn_periodic};

/// Interruptible wait used for the serial backoff.
#[derive(Debug, Default)]
struct Pause {
    woken: Mutex<bool>,
    signal: Condvar,
}

impl Pause {
    fn wait(&self, timeout: Duration) {
        let Ok(woken) = self.woken.lock() else { return };
        let Ok((mut woken, _)) = self.signal.wait_timeout_while(woken, timeout, |w| !*w) else {
            return;
        };
        *woken = false;
    }

    fn wake(&self) {
        if let Ok(mut woken) = self.woken.lock() {
            *woken = true;
        }
        self.signal.notify_all();
    }
}

struct Engine<R: Repository, B> {
    config: JobManagerConfig,
    sessions: SessionManager<R>,
    root: RecordPath,
    /// Long-lived session every claim is made with.
    background: R::Session,
    bus: B,
    queue: DispatchQueue,
    exclusion: Exclusion,
    in_flight: InFlightFlag,
    own_releases: OwnReleases,
    pause: Pause,
    stopping: AtomicBool,
}

impl<R, B> Engine<R, B>
where
    R: Repository,
    B: EventBus<Event> + 'static,
{
    fn process_id(&self) -> ProcessId {
        self.sessions.process_id()
    }

    fn dispatch_loop(self: Arc<Self>, drain: QueueDrain) {
        info!(process = %self.process_id(), root = %self.root, "job dispatcher started");
        loop {
            match drain.take() {
                QueueItem::Shutdown => break,
                QueueItem::Job(info) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    self.dispatch(info);
                }
            }
        }
        info!(process = %self.process_id(), "job dispatcher stopped");
    }

    fn dispatch(self: &Arc<Self>, info: JobInfo) {
        match info.path {
            None => match self.persist(&info.event) {
                Ok(Some(token)) => self.run_claimed(info.event, token),
                Ok(None) => {}
                Err(e) => warn!(
                    job_topic = job_topic(&info.event).unwrap_or_default(),
                    job_id = job_id(&info.event).unwrap_or_default(),
                    error = %e,
                    "cannot persist job; dropping request"
                ),
            },
            Some(path) => self.claim_stored(&path),
        }
    }

    /// Write a fresh job request as a record, created already locked by the
    /// background session. `None` when the request is a duplicate that loses
    /// to an existing record.
    fn persist(&self, event: &Event) -> Result<Option<LockToken>, StoreError> {
        let path = self
            .root
            .join(&codec::record_name(event))
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let properties = codec::write(event, self.process_id(), Utc::now())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.background.refresh()?;
        if let Some(existing) = self.background.get(&path)? {
            let existing = JobRecord::from_record(&existing);
            if existing.active && !existing.created_by(self.process_id()) {
                debug!(path = %path, "job already scheduled by another member; ignoring duplicate");
                return Ok(None);
            }
            if existing.locked {
                warn!(path = %path, "job is being processed; dropping duplicate request");
                return Ok(None);
            }
            match self
                .exclusion
                .remove_replaceable(&self.background, &path, self.process_id())?
            {
                Replacement::Vacant => {
                    debug!(path = %path, finished = !existing.active, "replaced existing job record");
                }
                Replacement::Kept => {
                    debug!(path = %path, "job was rescheduled by another member; ignoring duplicate");
                    return Ok(None);
                }
                Replacement::Busy => {
                    warn!(path = %path, "job is being processed; dropping duplicate request");
                    return Ok(None);
                }
            }
        }

        match self
            .background
            .create(&path, properties, Some(self.exclusion.lock_options()))
        {
            Ok(Some(token)) => {
                trace!(path = %path, "job record written");
                self.exclusion.adopt(token.clone());
                Ok(Some(token))
            }
            Ok(None) => Err(StoreError::Storage(format!("{path} was created without a lock"))),
            Err(StoreError::AlreadyExists(_)) => {
                debug!(path = %path, "another member wrote the job first");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn claim_stored(self: &Arc<Self>, path: &RecordPath) {
        let token = match self.exclusion.claim(&self.background, path) {
            Ok(ClaimOutcome::Claimed(token)) => token,
            Ok(ClaimOutcome::ClaimFailed) => {
                debug!(path = %path, "job is claimed elsewhere");
                return;
            }
            Ok(ClaimOutcome::NotActive) => {
                trace!(path = %path, "job no longer active");
                return;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "claim failed; job stays queued in the store");
                return;
            }
        };

        // The queued copy may predate a reschedule, so read the current one.
        let event = match self.background.get(path) {
            Ok(Some(record)) => codec::read(&record).map_err(|e| e.to_string()),
            Ok(None) => Err("record vanished".to_string()),
            Err(e) => Err(e.to_string()),
        };
        match event {
            Ok(event) => self.run_claimed(event, token),
            Err(reason) => {
                warn!(path = %path, error = %reason, "cannot read claimed job; releasing");
                self.release_quietly(&token);
            }
        }
    }

    fn run_claimed(self: &Arc<Self>, event: Event, token: LockToken) {
        match ExecutionMode::of(&event) {
            ExecutionMode::Parallel => self.process_job(event, token, false),
            ExecutionMode::Serial if self.in_flight.try_acquire() => self.process_job(event, token, true),
            ExecutionMode::Serial => self.defer(event, token),
        }
    }

    /// Another serial job is running here: give the record back and retry
    /// later.
    fn defer(&self, event: Event, token: LockToken) {
        let path = token.path().clone();
        trace!(path = %path, "serial job busy; deferring");
        self.release_quietly(&token);
        self.queue.enqueue(JobInfo::stored(event, path));
        if should_back_off(self.queue.len()) {
            self.pause.wait(self.config.sleep_time());
        }
    }

    fn release_quietly(&self, token: &LockToken) {
        self.own_releases.mark(token.path());
        if let Err(e) = self.exclusion.release(&self.background, token) {
            self.own_releases.unmark(token.path());
            warn!(path = %token.path(), error = %e, "cannot release job lock");
        }
    }

    /// Deliver the job to consumers on its own topic, with the completion
    /// context attached.
    fn process_job(self: &Arc<Self>, event: Event, token: LockToken, serial: bool) {
        let path = token.path().clone();
        let Some(topic) = job_topic(&event).map(str::to_string) else {
            warn!(path = %path, "stored job has no job topic; releasing");
            self.abandon(&token, serial);
            return;
        };

        let mut stamp = Properties::new();
        stamp.insert(PROPERTY_PROCESSOR.into(), Value::from(self.process_id().to_string()));
        if let Err(e) = self.background.set_properties(&path, stamp) {
            warn!(path = %path, error = %e, "cannot mark job as processing; releasing");
            self.abandon(&token, serial);
            return;
        }

        let (_, properties) = event.into_parts();
        let completion = JobCompletion {
            engine: Arc::clone(self),
            token: token.clone(),
            serial,
        };
        let delivered =
            Event::new(topic.as_str(), properties).with_completion(NotifierContext::new(Arc::new(completion)));

        debug!(path = %path, job_topic = %topic, serial, "delivering job");
        if let Err(e) = self.bus.publish(delivered) {
            warn!(path = %path, error = ?e, "cannot deliver job; releasing");
            self.abandon(&token, serial);
        }
    }

    /// Give up an attempt before it reached a consumer. The record stays
    /// active; the rescan picks it up again.
    fn abandon(&self, token: &LockToken, serial: bool) {
        self.release_quietly(token);
        if serial {
            self.free_serial_slot();
        }
    }

    fn free_serial_slot(&self) {
        self.in_flight.release();
        self.pause.wake();
    }

    /// Settle one execution attempt. Runs on whatever thread the consumer
    /// reported from, so it works through a session of its own.
    fn complete(&self, job: &Event, token: &LockToken, serial: bool, reschedule: bool) -> bool {
        let decision = retry_decision(job, reschedule, self.config.max_job_retries);
        let settled = self.settle(token, &decision);
        if serial {
            self.free_serial_slot();
        }

        let path = token.path();
        match (settled, &decision) {
            (Err(e), _) => {
                warn!(path = %path, error = %e, "cannot settle job; it will be picked up again");
                false
            }
            (Ok(()), RetryDecision::Finish) => {
                debug!(path = %path, "job finished");
                true
            }
            (Ok(()), RetryDecision::Exhausted { retries, retry_count }) => {
                warn!(path = %path, retries, retry_count, "retries exhausted; job finished");
                false
            }
            (Ok(()), RetryDecision::Reschedule { retry_count, delay, .. }) => {
                let next = JobInfo::stored(job.without_completion(), path.clone());
                match delay {
                    Some(delay) => {
                        debug!(path = %path, retry_count, delay_ms = delay.as_millis() as u64, "job rescheduled");
                        self.queue.enqueue_after(next, *delay);
                    }
                    None => {
                        debug!(path = %path, retry_count, "job rescheduled");
                        self.queue.enqueue(next);
                    }
                }
                true
            }
        }
    }

    fn settle(&self, token: &LockToken, decision: &RetryDecision) -> Result<(), StoreError> {
        let session = self.sessions.login()?;
        let token = self.exclusion.transfer(token, &self.background, &session)?;
        match decision {
            RetryDecision::Finish | RetryDecision::Exhausted { .. } => {
                self.exclusion.finish(&session, &token, Utc::now())
            }
            RetryDecision::Reschedule {
                retries, retry_count, ..
            } => {
                let mut counters = Properties::new();
                counters.insert(PROPERTY_JOB_RETRIES.into(), Value::Long(*retries));
                counters.insert(PROPERTY_JOB_RETRY_COUNT.into(), Value::Long(*retry_count));
                session.set_properties(token.path(), counters)?;

                self.own_releases.mark(token.path());
                self.exclusion.release(&session, &token).inspect_err(|_| {
                    self.own_releases.unmark(token.path());
                })
            }
        }
    }

    fn handle_event(&self, event: Event) -> bool {
        if !is_local(&event) || event.topic() != TOPIC_JOB || event.completion().is_some() {
            return false;
        }
        if job_topic(&event).is_none() || job_id(&event).is_none() {
            warn!(
                job_topic = job_topic(&event).unwrap_or_default(),
                job_id = job_id(&event).unwrap_or_default(),
                "job event lacks job topic or id; dropping"
            );
            return false;
        }
        if let Err(e) = codec::validate(&event) {
            warn!(
                job_topic = job_topic(&event).unwrap_or_default(),
                job_id = job_id(&event).unwrap_or_default(),
                error = %e,
                "job event cannot be stored; dropping"
            );
            return false;
        }
        self.queue.enqueue(JobInfo::fresh(event))
    }

    fn jobs(&self, topic: Option<&str>, filter: &EventProperties, locked: bool) -> Vec<Event> {
        let result = self.sessions.login().and_then(|session| {
            session.refresh()?;
            let mut query = Query::under(self.root.clone())
                .eq(PROPERTY_ACTIVE, true)
                .locked(locked);
            if let Some(topic) = topic {
                query = query.eq(PROPERTY_TOPIC, topic);
            }
            session.query(&query)
        });

        match result {
            Ok(records) => records
                .iter()
                .filter_map(|record| match codec::read(record) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(path = %record.path, error = %e, "skipping undecodable job record");
                        None
                    }
                })
                .filter(|event| {
                    filter
                        .iter()
                        .all(|(name, value)| event.property(name) == Some(value))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "job query failed");
                Vec::new()
            }
        }
    }

    fn cleanup_cycle(&self, cleanup: &Cleanup) {
        let session = match self.sessions.login() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cleanup skipped: cannot open session");
                return;
            }
        };
        match cleanup.run(&session, Utc::now()) {
            Ok(report) if report.skipped => {}
            Ok(report) => info!(removed = report.removed, failed = report.failed, "finished jobs purged"),
            Err(e) => warn!(error = %e, "cleanup failed"),
        }
        match recovery::recover(&session, &self.root, &self.queue) {
            Ok(0) => {}
            Ok(queued) => info!(queued, "unclaimed jobs found by rescan"),
            Err(e) => warn!(error = %e, "rescan failed"),
        }
    }
}

/// Completion context of one delivered job.
struct JobCompletion<R: Repository, B> {
    engine: Arc<Engine<R, B>>,
    token: LockToken,
    serial: bool,
}

impl<R, B> JobStatusNotifier for JobCompletion<R, B>
where
    R: Repository,
    B: EventBus<Event> + 'static,
{
    fn finished_job(&self, job: &Event, reschedule: bool) -> bool {
        self.engine.complete(job, &self.token, self.serial, reschedule)
    }
}

/// A running job engine. Stop it with [`JobEventHandler::shutdown`].
pub struct JobEventHandler<R: Repository, B> {
    engine: Arc<Engine<R, B>>,
    workers: Vec<WorkerHandle>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl<R, B> JobEventHandler<R, B>
where
    R: Repository,
    B: EventBus<Event> + 'static,
{
    /// Bring the engine up: resolve the process id, open the background
    /// session, queue every unclaimed job and start the workers.
    pub fn activate(
        config: JobManagerConfig,
        identity: &dyn IdentityProvider,
        repository: R,
        bus: B,
    ) -> Result<Self, JobManagerError> {
        config.validate()?;
        let root = config.repository_root()?;
        let process_id = identity.process_id()?;
        let sessions = SessionManager::new(repository, process_id, root.clone());

        let background = sessions.activate().inspect_err(|e| {
            error!(process = %process_id, error = %e, "job engine activation failed");
        })?;
        let changes = sessions.observe()?;
        let listener_session = sessions.login()?;
        let inbound = bus.subscribe();

        let (queue, drain) = queue::channel();
        let engine = Arc::new(Engine {
            exclusion: Exclusion::new(config.lock_timeout()),
            config,
            sessions,
            root,
            background,
            bus,
            queue,
            in_flight: InFlightFlag::new(),
            own_releases: OwnReleases::new(),
            pause: Pause::default(),
            stopping: AtomicBool::new(false),
        });

        let recovered = recovery::recover(&engine.background, &engine.root, &engine.queue)?;
        info!(process = %process_id, recovered, "recovered unclaimed jobs");

        let mut handler = Self {
            engine: Arc::clone(&engine),
            workers: Vec::new(),
            dispatcher: None,
        };

        let dispatcher = Arc::clone(&engine);
        let spawned = thread::Builder::new()
            .name("jobmesh-dispatcher".to_string())
            .spawn(move || dispatcher.dispatch_loop(drain));
        let dispatcher = handler.started(spawned)?;
        handler.dispatcher = Some(dispatcher);

        let bus_engine = Arc::clone(&engine);
        let worker = spawn_inbox_worker("jobmesh-bus", inbound, move |event: Event| {
            bus_engine.handle_event(event);
        });
        let worker = handler.started(worker)?;
        handler.workers.push(worker);

        let listener_engine = Arc::clone(&engine);
        let worker = spawn_inbox_worker("jobmesh-listener", changes, move |change: ChangeEvent| {
            let engine = &listener_engine;
            if let Err(e) = listener::handle_change(
                &listener_session,
                &change,
                &engine.root,
                &engine.queue,
                &engine.own_releases,
            ) {
                warn!(path = %change.path, error = %e, "cannot inspect changed job");
            }
        });
        let worker = handler.started(worker)?;
        handler.workers.push(worker);

        if let Some(period) = engine.config.cleanup_period() {
            let cleanup = Cleanup::new(engine.root.clone(), engine.config.retention());
            let cleanup_engine = Arc::clone(&engine);
            let worker = spawn_periodic("jobmesh-cleanup", period, move || {
                cleanup_engine.cleanup_cycle(&cleanup);
            });
            let worker = handler.started(worker)?;
            handler.workers.push(worker);
        }

        if let Some(timeout) = engine.config.lock_timeout() {
            let keeper_engine = Arc::clone(&engine);
            let worker = spawn_periodic("jobmesh-lock-keeper", timeout / 3, move || {
                let renewed = keeper_engine.exclusion.renew_held(&keeper_engine.background);
                trace!(renewed, "job locks renewed");
            });
            let worker = handler.started(worker)?;
            handler.workers.push(worker);
        }

        info!(process = %process_id, root = %engine.root, "job engine started");
        Ok(handler)
    }

    /// Unwind already started workers when a later one fails to spawn.
    fn started<T>(&mut self, spawned: std::io::Result<T>) -> Result<T, JobManagerError> {
        spawned.map_err(|e| {
            error!(error = %e, "cannot start job engine thread");
            self.stop();
            JobManagerError::Spawn(e)
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.engine.process_id()
    }

    /// Take an inbound event directly, bypassing the bus. Returns `true` when
    /// it was queued as a job.
    pub fn handle_event(&self, event: Event) -> bool {
        self.engine.handle_event(event)
    }

    /// Publish a job request on the bus the engine listens to.
    pub fn submit(&self, event: Event) -> Result<(), JobManagerError> {
        self.engine
            .bus
            .publish(event)
            .map_err(|e| JobManagerError::Bus(format!("{e:?}")))
    }

    /// Active jobs some member currently holds.
    pub fn current_jobs(&self, topic: Option<&str>, filter: &EventProperties) -> Vec<Event> {
        self.engine.jobs(topic, filter, true)
    }

    /// Active jobs waiting to be claimed.
    pub fn scheduled_jobs(&self, topic: Option<&str>, filter: &EventProperties) -> Vec<Event> {
        self.engine.jobs(topic, filter, false)
    }

    pub fn queue_len(&self) -> usize {
        self.engine.queue.len()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<R: Repository, B> JobEventHandler<R, B> {
    fn stop(&mut self) {
        if self.engine.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.pause.wake();
        for worker in self.workers.drain(..) {
            worker.shutdown();
        }
        self.engine.queue.shutdown();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        info!(process = %self.engine.sessions.process_id(), "job engine stopped");
    }
}

/// Dropping the handler stops the engine the same way `shutdown` does.
impl<R: Repository, B> Drop for JobEventHandler<R, B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<R: Repository, B> core::fmt::Debug for JobEventHandler<R, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobEventHandler")
            .field("root", &self.engine.root)
            .field("process", &self.engine.sessions.process_id())
            .field("workers", &self.workers.len())
            .finish()
    }
}
