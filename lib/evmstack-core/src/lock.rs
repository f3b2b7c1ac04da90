//! Run lock of a deployment.

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
};

use snafu::ResultExt as _;
use tracing::debug;

use crate::error::{AlreadyRunning, Filesystem, OrchestratorError};

/// Name of the pid file, relative to the deployment root.
pub const PID_FILE: &str = "evmstack.pid";

/// Process ID file held by the daemon while it runs a deployment.
///
/// Only one daemon may run a given deployment root. The file also tells other commands which instance suffix the
/// running daemon used for its container names.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Creates the pid file under `root`, holding the current process ID.
    ///
    /// # Errors
    ///
    /// If the pid file already exists or cannot be written, an error will be returned.
    pub fn acquire(root: &Path) -> Result<Self, OrchestratorError> {
        let path = root.join(PID_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return AlreadyRunning { path }.fail(),
            Err(e) => return Err(e).context(Filesystem { path }),
        };
        write!(file, "{}", std::process::id()).context(Filesystem { path: &path })?;

        debug!("Acquired run lock '{}'.", path.display());
        Ok(Self { path })
    }

    /// Reads the process ID held in the pid file under `root`, if the file exists.
    ///
    /// # Errors
    ///
    /// If the file exists but cannot be read, an error will be returned. Contents that are not a process ID read as
    /// `None`.
    pub fn read_pid(root: &Path) -> Result<Option<u32>, OrchestratorError> {
        let path = root.join(PID_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(Filesystem { path }),
        }
    }

    /// Removes a pid file left behind by a daemon that did not shut down cleanly. Returns `true` if there was one.
    ///
    /// # Errors
    ///
    /// If the file exists but cannot be removed, an error will be returned.
    pub fn remove_stale(root: &Path) -> Result<bool, OrchestratorError> {
        let path = root.join(PID_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(Filesystem { path }),
        }
    }

    /// Path of the pid file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the pid file. A file already removed by someone else is not an error.
    ///
    /// # Errors
    ///
    /// If the file exists but cannot be removed, an error will be returned.
    pub fn release(self) -> Result<(), OrchestratorError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released run lock '{}'.", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(Filesystem { path: self.path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let lock = RunLock::acquire(dir.path()).unwrap();
        assert_eq!(RunLock::read_pid(dir.path()).unwrap(), Some(std::process::id()));
        assert!(matches!(
            RunLock::acquire(dir.path()),
            Err(OrchestratorError::AlreadyRunning { .. })
        ));

        lock.release().unwrap();
        assert!(!dir.path().join(PID_FILE).exists());
        RunLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn missing_or_garbled_pid_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(RunLock::read_pid(dir.path()).unwrap(), None);

        std::fs::write(dir.path().join(PID_FILE), "not a pid").unwrap();
        assert_eq!(RunLock::read_pid(dir.path()).unwrap(), None);
    }

    #[test]
    fn stale_pid_file_can_be_cleared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PID_FILE), "4242").unwrap();

        assert!(RunLock::remove_stale(dir.path()).unwrap());
        assert!(!RunLock::remove_stale(dir.path()).unwrap());
        RunLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn release_tolerates_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::acquire(dir.path()).unwrap();
        std::fs::remove_file(lock.path()).unwrap();

        lock.release().unwrap();
    }
}
