//! Single-instance enforcement via an exclusive advisory file lock.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::SessionError;

/// Holds the exclusive lock for the lifetime of the pipeline run. The lock
/// is released when the guard drops, including on panic or early return.
#[derive(Debug)]
pub struct InstanceLock {
    _lock: Flock<File>,
}

impl InstanceLock {
    /// Acquire the lock non-blockingly. A held lock means another pipeline
    /// instance is active system-wide; callers map that to exit code 114.
    pub fn acquire(path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(InstanceLock { _lock: lock }),
            Err((_file, _errno)) => Err(SessionError::AlreadyRunning),
        }
    }
}
