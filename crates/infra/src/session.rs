//! Store session management for one cluster member.

use jobmesh_core::{ProcessId, RecordPath};
use jobmesh_store::{ChangeSubscription, Repository, StoreError};

use crate::error::JobManagerError;

/// Owns the repository handle and the local process id, and opens sessions
/// rooted at the job subtree.
#[derive(Debug)]
pub struct SessionManager<R: Repository> {
    repository: R,
    process_id: ProcessId,
    root: RecordPath,
}

impl<R: Repository> SessionManager<R> {
    pub fn new(repository: R, process_id: ProcessId, root: RecordPath) -> Self {
        Self {
            repository,
            process_id,
            root,
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn root(&self) -> &RecordPath {
        &self.root
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn login(&self) -> Result<R::Session, StoreError> {
        self.repository.login()
    }

    /// Open the long-lived background session and make sure the job subtree
    /// exists. Failure here keeps the engine from starting.
    pub fn activate(&self) -> Result<R::Session, JobManagerError> {
        use jobmesh_store::Session as _;

        let session = self
            .login()
            .map_err(|e| JobManagerError::Activation(format!("cannot open store session: {e}")))?;
        session.ensure_path(&self.root).map_err(|e| {
            JobManagerError::Activation(format!("cannot create {}: {e}", self.root))
        })?;
        Ok(session)
    }

    pub fn observe(&self) -> Result<ChangeSubscription, StoreError> {
        self.repository.observe(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_store::{MemoryRepository, Session};

    #[test]
    fn activation_creates_the_job_subtree() {
        let repo = MemoryRepository::new();
        let root = RecordPath::new("/var/jobmesh/jobs").unwrap();
        let manager = SessionManager::new(repo.clone(), ProcessId::new(), root.clone());

        let background = manager.activate().unwrap();
        assert!(background.exists(&root).unwrap());
        assert!(repo.login().unwrap().exists(&RecordPath::new("/var").unwrap()).unwrap());
    }

    #[test]
    fn sessions_are_distinct() {
        let manager = SessionManager::new(
            MemoryRepository::new(),
            ProcessId::new(),
            RecordPath::new("/jobs").unwrap(),
        );
        let a = manager.login().unwrap();
        let b = manager.login().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
