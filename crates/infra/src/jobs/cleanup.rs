//! Periodic purge of finished job records.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobmesh_core::RecordPath;
use jobmesh_store::{LockOptions, Query, Session, StoreError, Value};

use super::codec::{PROPERTY_ACTIVE, PROPERTY_FINISHED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
    /// Another member held the root lock; nothing was done.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct Cleanup {
    root: RecordPath,
    retention: chrono::Duration,
}

impl Cleanup {
    pub fn new(root: RecordPath, retention: chrono::Duration) -> Self {
        Self { root, retention }
    }

    /// Remove every finished record whose finish time is older than
    /// `now - retention`, under the cluster-wide lock on the subtree root.
    pub fn run<S: Session>(&self, session: &S, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        match session.lock(&self.root, LockOptions::default()) {
            Ok(_) => {}
            Err(StoreError::Locked(_)) => {
                debug!(path = %self.root, "cleanup already running elsewhere");
                return Ok(CleanupReport {
                    skipped: true,
                    ..CleanupReport::default()
                });
            }
            Err(e) => return Err(e),
        }

        let result = self.purge(session, now);
        if let Err(e) = session.unlock(&self.root) {
            warn!(path = %self.root, error = %e, "failed to release cleanup lock");
        }
        result
    }

    fn purge<S: Session>(&self, session: &S, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return Ok(CleanupReport::default());
        };
        session.refresh()?;
        let expired = session.query(
            &Query::under(self.root.clone())
                .eq(PROPERTY_ACTIVE, false)
                .lt(PROPERTY_FINISHED, Value::Date(cutoff)),
        )?;

        let mut report = CleanupReport::default();
        for record in expired {
            match session.remove(&record.path) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(path = %record.path, error = %e, "failed to remove finished job");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
