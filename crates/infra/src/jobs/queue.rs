//! Local dispatch queue.
//!
//! Unbounded FIFO between the producers (bus callback, change listener,
//! recovery, the dispatcher's own requeues) and the single dispatcher thread.
//! Enqueueing never blocks. Items that refer to a record path already waiting
//! in the queue are coalesced, since claiming the record once is enough.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use jobmesh_core::RecordPath;
use jobmesh_events::Event;

/// A job waiting for the dispatcher.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub event: Event,
    /// `None` until the job has been written to the store.
    pub path: Option<RecordPath>,
}

impl JobInfo {
    pub fn fresh(event: Event) -> Self {
        Self { event, path: None }
    }

    pub fn stored(event: Event, path: RecordPath) -> Self {
        Self {
            event,
            path: Some(path),
        }
    }
}

#[derive(Debug)]
pub enum QueueItem {
    Job(JobInfo),
    /// Sentinel that stops the dispatcher.
    Shutdown,
}

#[derive(Debug, Default)]
struct Shared {
    len: AtomicUsize,
    pending: Mutex<HashSet<RecordPath>>,
}

impl Shared {
    fn mark_pending(&self, path: &RecordPath) -> bool {
        match self.pending.lock() {
            Ok(mut pending) => pending.insert(path.clone()),
            Err(poisoned) => poisoned.into_inner().insert(path.clone()),
        }
    }

    fn clear_pending(&self, path: &RecordPath) {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(path),
            Err(poisoned) => poisoned.into_inner().remove(path),
        };
    }
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    sender: Sender<QueueItem>,
    shared: Arc<Shared>,
}

/// Consumer side, owned by the dispatcher thread.
#[derive(Debug)]
pub struct QueueDrain {
    receiver: Receiver<QueueItem>,
    shared: Arc<Shared>,
}

pub fn channel() -> (DispatchQueue, QueueDrain) {
    let (sender, receiver) = mpsc::channel();
    let shared = Arc::new(Shared::default());
    (
        DispatchQueue {
            sender,
            shared: Arc::clone(&shared),
        },
        QueueDrain { receiver, shared },
    )
}

impl DispatchQueue {
    /// Queue a job. Returns `false` when the item was coalesced with one
    /// already waiting, or the dispatcher is gone.
    pub fn enqueue(&self, info: JobInfo) -> bool {
        if let Some(path) = &info.path {
            if !self.shared.mark_pending(path) {
                return false;
            }
        }
        self.send(info)
    }

    /// Queue a job once `delay` has passed. The path counts as pending from
    /// now on, so rescans leave it alone while it waits.
    pub fn enqueue_after(&self, info: JobInfo, delay: Duration) {
        if let Some(path) = &info.path {
            if !self.shared.mark_pending(path) {
                return;
            }
        }
        let queue = self.clone();
        let fallback = info.clone();
        let spawned = thread::Builder::new()
            .name("jobmesh-delayed-enqueue".to_string())
            .spawn(move || {
                thread::sleep(delay);
                queue.send(info);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "cannot delay requeue; queueing immediately");
            self.send(fallback);
        }
    }

    fn send(&self, info: JobInfo) -> bool {
        let path = info.path.clone();
        self.shared.len.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(QueueItem::Job(info)).is_err() {
            self.shared.len.fetch_sub(1, Ordering::SeqCst);
            if let Some(path) = path {
                self.shared.clear_pending(&path);
            }
            return false;
        }
        true
    }

    /// Wake the dispatcher with the shutdown sentinel.
    pub fn shutdown(&self) {
        let _ = self.sender.send(QueueItem::Shutdown);
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, path: &RecordPath) -> bool {
        match self.shared.pending.lock() {
            Ok(pending) => pending.contains(path),
            Err(poisoned) => poisoned.into_inner().contains(path),
        }
    }
}

impl QueueDrain {
    /// Block until the next item. A closed queue reads as shutdown.
    pub fn take(&self) -> QueueItem {
        match self.receiver.recv() {
            Ok(QueueItem::Job(info)) => {
                self.shared.len.fetch_sub(1, Ordering::SeqCst);
                if let Some(path) = &info.path {
                    self.shared.clear_pending(path);
                }
                QueueItem::Job(info)
            }
            Ok(QueueItem::Shutdown) | Err(_) => QueueItem::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_events::job_request;

    fn path(p: &str) -> RecordPath {
        RecordPath::new(p).unwrap()
    }

    #[test]
    fn items_come_out_in_order() {
        let (queue, drain) = channel();
        queue.enqueue(JobInfo::fresh(job_request("t", "1")));
        queue.enqueue(JobInfo::fresh(job_request("t", "2")));
        assert_eq!(queue.len(), 2);

        let QueueItem::Job(first) = drain.take() else { panic!("expected job") };
        assert_eq!(jobmesh_events::job_id(&first.event), Some("1"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stored_items_for_the_same_path_coalesce() {
        let (queue, drain) = channel();
        assert!(queue.enqueue(JobInfo::stored(job_request("t", "1"), path("/j/a"))));
        assert!(!queue.enqueue(JobInfo::stored(job_request("t", "1"), path("/j/a"))));
        assert!(queue.is_pending(&path("/j/a")));
        assert_eq!(queue.len(), 1);

        drain.take();
        assert!(!queue.is_pending(&path("/j/a")));
        assert!(queue.enqueue(JobInfo::stored(job_request("t", "1"), path("/j/a"))));
    }

    #[test]
    fn shutdown_sentinel_unblocks_take() {
        let (queue, drain) = channel();
        let handle = thread::spawn(move || matches!(drain.take(), QueueItem::Shutdown));
        queue.shutdown();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn delayed_items_are_pending_while_waiting() {
        let (queue, drain) = channel();
        queue.enqueue_after(
            JobInfo::stored(job_request("t", "1"), path("/j/a")),
            Duration::from_millis(30),
        );
        assert!(queue.is_pending(&path("/j/a")));
        assert_eq!(queue.len(), 0);

        let QueueItem::Job(info) = drain.take() else { panic!("expected job") };
        assert_eq!(info.path, Some(path("/j/a")));
    }
}
