//! One server per id.
//!
//! An exclusive `flock` on `server-<id>.lock` in the config directory. The
//! OS drops the lock if the process dies, so stale lock files never block a
//! new server.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::shutdown::HostServer;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("another server already runs with id {id} ({})", .path.display())]
    AlreadyRunning { id: u32, path: PathBuf },
    #[error("failed to lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct InstanceLock {
    file: Option<File>,
    path: PathBuf,
    id: u32,
}

impl InstanceLock {
    pub fn acquire(dir: &Path, id: u32) -> Result<Self, InstanceError> {
        let path = dir.join(format!("server-{id}.lock"));
        let io_err = |source| InstanceError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(InstanceError::AlreadyRunning {
                        id,
                        path: path.clone(),
                    });
                }
                return Err(io_err(err));
            }
        }

        tracing::debug!(path = %path.display(), id, "acquired instance lock");
        Ok(Self {
            file: Some(file),
            path,
            id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl HostServer for InstanceLock {
    fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        drop(file);
        tracing::info!(path = %self.path.display(), id = self.id, "released instance lock");
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn second_server_with_same_id_is_refused() {
        let dir = TempDir::new().unwrap();
        let first = InstanceLock::acquire(dir.path(), 3).unwrap();
        assert!(first.path().ends_with("server-3.lock"));
        assert!(matches!(
            InstanceLock::acquire(dir.path(), 3),
            Err(InstanceError::AlreadyRunning { id: 3, .. })
        ));
        let other = InstanceLock::acquire(dir.path(), 4).unwrap();
        assert!(other.is_held());
    }

    #[test]
    fn release_frees_the_id() {
        let dir = TempDir::new().unwrap();
        let mut lock = InstanceLock::acquire(dir.path(), 0).unwrap();
        lock.release();
        lock.release();
        assert!(!lock.is_held());
        let again = InstanceLock::acquire(dir.path(), 0).unwrap();
        assert!(again.is_held());
    }
}
