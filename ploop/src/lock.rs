//! File locks.
//!
//! Two kinds of advisory `flock` are used:
//!
//! - the global lock, a well-known file every ploop tool takes (blocking)
//!   before scanning devices, so that device discovery sees a stable set;
//! - the balloon lock, taken non-blocking on the hidden balloon file itself
//!   so that only one tool resizes a balloon at a time.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use ploop_shared::errors::{IoOp, PloopError, PloopResult};

/// A guard that holds the global ploop lock.
///
/// The lock is released when this guard is dropped, or when the process
/// exits.
#[derive(Debug)]
pub struct GlobalLock {
    file: File,
    path: PathBuf,
}

impl GlobalLock {
    /// Acquire the global lock at `lock_path`, waiting for other holders.
    pub fn acquire(lock_path: &Path) -> PloopResult<Self> {
        if let Some(dir) = lock_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                PloopError::Lock(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| {
                PloopError::Lock(format!("failed to open {}: {}", lock_path.display(), e))
            })?;

        flock(&file, libc::LOCK_EX).map_err(|e| {
            PloopError::Lock(format!("failed to lock {}: {}", lock_path.display(), e))
        })?;

        tracing::debug!(lock_path = %lock_path.display(), "Acquired global lock");
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        let _ = flock(&self.file, libc::LOCK_UN);
        tracing::debug!(lock_path = %self.path.display(), "Released global lock");
    }
}

/// Take an exclusive lock on `file` without waiting.
///
/// Contention is reported as [`PloopError::Busy`] with `busy_message`.
pub fn try_lock_exclusive(file: &File, what: &Path, busy_message: &str) -> PloopResult<()> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(PloopError::Busy(busy_message.to_string()))
        }
        Err(e) => Err(PloopError::io(IoOp::Flock, what.display().to_string(), e)),
    }
}

pub fn unlock(file: &File) {
    let _ = flock(file, libc::LOCK_UN);
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("ploop.lck");
        let lock = GlobalLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_global_lock_waits_for_holder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ploop.lck");

        let first = GlobalLock::acquire(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lock = GlobalLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_try_lock_reports_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("balloon");
        std::fs::write(&path, b"").unwrap();

        let holder = File::open(&path).unwrap();
        try_lock_exclusive(&holder, &path, "in use").unwrap();

        let other = File::open(&path).unwrap();
        let err = try_lock_exclusive(&other, &path, "in use").unwrap_err();
        assert!(matches!(err, PloopError::Busy(ref m) if m == "in use"));

        unlock(&holder);
        try_lock_exclusive(&other, &path, "in use").unwrap();
    }
}
