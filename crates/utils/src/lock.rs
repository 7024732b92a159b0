//! Advisory `flock`-based sidecar lockfiles, used to guard unix socket paths
//! across restarts so a stale socket left behind by a dead process can be
//! unlinked safely while a live process's socket never is.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct Lock {
    _file: File,
    path: PathBuf,
}

impl Lock {
    /// Attempts to acquire an exclusive, non-blocking advisory lock on
    /// `<path>.lock`. Returns `Ok(None)` (not an error) when the lock is
    /// already held by another process, matching `acquire_lock`'s
    /// "return 0, caller treats the existing socket as live" contract.
    #[cfg(unix)]
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Option<Lock>> {
        use std::os::unix::io::AsRawFd;

        let lock_path = lock_path_for(path.as_ref());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(Lock {
            _file: file,
            path: lock_path,
        }))
    }

    #[cfg(not(unix))]
    pub fn acquire(_path: impl AsRef<Path>) -> io::Result<Option<Lock>> {
        Ok(None)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_drop_removes_the_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("srs.sock");
        let lock = Lock::acquire(&sock_path).unwrap();
        assert!(lock.is_some());
        let lock_path = lock_path_for(&sock_path);
        assert!(lock_path.exists());
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn a_second_acquire_on_the_same_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("srs.sock");
        let first = Lock::acquire(&sock_path).unwrap();
        assert!(first.is_some());
        let second = Lock::acquire(&sock_path).unwrap();
        assert!(second.is_none());
    }
}
