//! Background worker threads with graceful shutdown.
//!
//! Every worker owns a shutdown channel and polls it between units of work,
//! so stopping never has to interrupt a blocked call.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use jobmesh_events::Subscription;
use jobmesh_store::{ChangeEvent, ChangeSubscription};

pub mod consumer_worker;

pub use consumer_worker::ConsumerWorker;

const TICK: Duration = Duration::from_millis(250);

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(j) = self.join.take() else { return };
        let _ = self.shutdown.send(());
        if j.thread().id() != thread::current().id() {
            let _ = j.join();
        }
        debug!(worker = %self.name, "worker stopped");
    }
}

/// A handle dropped without `shutdown` still stops its worker.
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Something a worker can wait on with a timeout.
pub trait Inbox: Send + 'static {
    type Item;

    fn recv_timeout(&self, timeout: Duration) -> Result<Self::Item, RecvTimeoutError>;
}

impl<M: Send + 'static> Inbox for Subscription<M> {
    type Item = M;

    fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        Subscription::recv_timeout(self, timeout)
    }
}

impl Inbox for ChangeSubscription {
    type Item = ChangeEvent;

    fn recv_timeout(&self, timeout: Duration) -> Result<ChangeEvent, RecvTimeoutError> {
        ChangeSubscription::recv_timeout(self, timeout)
    }
}

/// Spawn a thread that feeds every item from `inbox` to `handler` until shut
/// down or until the inbox disconnects.
pub fn spawn_inbox_worker<I, H>(name: &str, inbox: I, mut handler: H) -> io::Result<WorkerHandle>
where
    I: Inbox,
    H: FnMut(I::Item) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let worker = name.to_string();
    let join = thread::Builder::new().name(name.to_string()).spawn(move || {
        info!(worker = %worker, "worker started");
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match inbox.recv_timeout(TICK) {
                Ok(item) => handler(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

/// Spawn a thread that runs `task` every `period` until shut down. The first
/// run happens one period after start.
pub fn spawn_periodic<F>(name: &str, period: Duration, mut task: F) -> io::Result<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let worker = name.to_string();
    let join = thread::Builder::new().name(name.to_string()).spawn(move || {
        info!(worker = %worker, period_ms = period.as_millis() as u64, "timer started");
        while let Err(RecvTimeoutError::Timeout) = shutdown_rx.recv_timeout(period) {
            task();
        }
    })?;

    Ok(WorkerHandle {
        name: name.to_string(),
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jobmesh_events::{EventBus, InMemoryEventBus};

    #[test]
    fn inbox_worker_handles_messages_until_shutdown() {
        let bus = InMemoryEventBus::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = spawn_inbox_worker("test-inbox", bus.subscribe(), move |n: u32| {
            counter.fetch_add(n as usize, Ordering::SeqCst);
        })
        .unwrap();

        bus.publish(2).unwrap();
        bus.publish(3).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn periodic_worker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("test-timer", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        let after = ticks.load(Ordering::SeqCst);
        assert!(after >= 1);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }
}
