//! Exclusive access to registry storage.
//!
//! Registration and matching sessions both hold this lock for their whole
//! lifetime so they never run against the same registry directory at once.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOCK_FILE: &str = ".lock";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("registry {0} is in use by another session (remove {0}/.lock if that session died)")]
    Held(PathBuf),
    #[error("cannot create lock in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lock file guard. Released on drop.
#[derive(Debug)]
pub struct StorageLock {
    path: PathBuf,
}

impl StorageLock {
    /// Acquire the lock for `dir`, creating the directory if needed.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held(dir.to_path_buf()));
            }
            Err(e) => return Err(io_err(e)),
        };
        // Owner pid helps an operator decide whether a leftover lock is stale.
        let _ = writeln!(file, "{}", std::process::id());

        tracing::debug!(path = %path.display(), "storage lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}
