//! Stable identity of the local process.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use jobmesh_core::ProcessId;

use crate::error::JobManagerError;

/// Supplies the id this process stamps on the job records it creates and
/// processes. It must survive restarts so a restarted member recognises its
/// own records.
pub trait IdentityProvider: Send + Sync {
    fn process_id(&self) -> Result<ProcessId, JobManagerError>;
}

/// Fixed identity (tests, embedding).
#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub ProcessId);

impl IdentityProvider for StaticIdentity {
    fn process_id(&self) -> Result<ProcessId, JobManagerError> {
        Ok(self.0)
    }
}

/// Identity persisted in a file holding a single UUID.
///
/// A missing file is created with a fresh id. A file that does not parse is
/// an error: silently replacing it would orphan the records created under the
/// old id.
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
}

impl FileIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityProvider for FileIdentity {
    fn process_id(&self) -> Result<ProcessId, JobManagerError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => raw.parse().map_err(|e| {
                JobManagerError::Identity(format!("{}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let id = ProcessId::new();
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|e| {
                        JobManagerError::Identity(format!("{}: {e}", parent.display()))
                    })?;
                }
                fs::write(&self.path, id.to_string()).map_err(|e| {
                    JobManagerError::Identity(format!("{}: {e}", self.path.display()))
                })?;
                info!(process_id = %id, file = %self.path.display(), "generated new process id");
                Ok(id)
            }
            Err(e) => Err(JobManagerError::Identity(format!("{}: {e}", self.path.display()))),
        }
    }
}
