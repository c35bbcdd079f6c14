//! Startup recovery: queue every active job nobody holds.

use tracing::{debug, warn};

use jobmesh_core::RecordPath;
use jobmesh_store::{Query, Session, StoreError};

use super::codec::{self, PROPERTY_ACTIVE};
use super::queue::{DispatchQueue, JobInfo};

/// Queue all active, unlocked records under `root` with their path set, so
/// the dispatcher goes straight to claiming them.
///
/// Locked records belong to a live member and are skipped. Records that fail
/// to decode are logged and skipped. Returns the number of jobs queued;
/// records already waiting in the queue are not queued twice.
pub fn recover<S: Session>(
    session: &S,
    root: &RecordPath,
    queue: &DispatchQueue,
) -> Result<usize, StoreError> {
    session.refresh()?;
    let records = session.query(
        &Query::under(root.clone())
            .eq(PROPERTY_ACTIVE, true)
            .locked(false),
    )?;

    let mut queued = 0;
    for record in records {
        if queue.is_pending(&record.path) {
            continue;
        }
        match codec::read(&record) {
            Ok(event) => {
                if queue.enqueue(JobInfo::stored(event, record.path.clone())) {
                    debug!(path = %record.path, "queued unclaimed job");
                    queued += 1;
                }
            }
            Err(e) => warn!(path = %record.path, error = %e, "skipping undecodable job record"),
        }
    }
    Ok(queued)
}
