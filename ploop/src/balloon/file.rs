//! The hidden balloon file.

use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use ploop_shared::errors::{IoOp, PloopError, PloopResult};

use super::extents::{Extent, fiemap};
use crate::lock;

mod raw {
    // EXT4_IOC_OPEN_BALLOON: returns a new descriptor for the hidden balloon.
    nix::ioctl_none!(ext4_open_balloon, b'f', 42);
}

/// Operations the balloon pipeline needs from the balloon file.
pub trait BalloonFile {
    /// Human-readable name for messages.
    fn path(&self) -> &Path;

    /// Current size in bytes.
    fn size(&self) -> PloopResult<u64>;

    /// Filesystem block size.
    fn block_size(&self) -> PloopResult<u64>;

    /// Device number of the filesystem holding the balloon.
    fn device_id(&self) -> PloopResult<u64>;

    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Allocate blocks up to `len` bytes (fallocate, mode 0).
    fn allocate(&self, len: u64) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    /// Raw extent list for the byte range `[start, end)`.
    fn raw_extents(&self, start: u64, end: u64) -> PloopResult<Vec<Extent>>;
}

/// Hidden balloon of a mounted filesystem, locked for exclusive use.
#[derive(Debug)]
pub struct Balloon {
    file: File,
    path: PathBuf,
}

impl Balloon {
    /// Open and lock the hidden balloon of the filesystem mounted at
    /// `mount_point`.
    pub fn open(mount_point: &Path) -> PloopResult<Self> {
        let dir = File::open(mount_point)
            .map_err(|e| PloopError::io(IoOp::Open, mount_point.display().to_string(), e))?;

        // SAFETY: the ioctl takes no argument; `dir` stays open for the call.
        let fd = unsafe { raw::ext4_open_balloon(dir.as_raw_fd()) }
            .map_err(|e| PloopError::ioctl("EXT4_IOC_OPEN_BALLOON", e.into()))?;
        // SAFETY: the kernel returned a fresh descriptor we now own.
        let file = unsafe { File::from_raw_fd(fd) };

        Self::from_file(file, mount_point.join(".balloon"))
    }

    /// Lock an already opened balloon file.
    pub fn from_file(file: File, path: PathBuf) -> PloopResult<Self> {
        lock::try_lock_exclusive(&file, &path, "hidden balloon is in use by someone else")?;
        tracing::debug!(balloon = %path.display(), "Locked hidden balloon");
        Ok(Self { file, path })
    }

    fn metadata(&self) -> PloopResult<std::fs::Metadata> {
        self.file
            .metadata()
            .map_err(|e| PloopError::io(IoOp::Stat, self.path.display().to_string(), e))
    }
}

impl Drop for Balloon {
    fn drop(&mut self) {
        lock::unlock(&self.file);
        tracing::debug!(balloon = %self.path.display(), "Unlocked hidden balloon");
    }
}

impl BalloonFile for Balloon {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> PloopResult<u64> {
        Ok(self.metadata()?.len())
    }

    fn block_size(&self) -> PloopResult<u64> {
        Ok(self.metadata()?.blksize())
    }

    fn device_id(&self) -> PloopResult<u64> {
        Ok(self.metadata()?.dev())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn allocate(&self, len: u64) -> io::Result<()> {
        let len = libc::off_t::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size overflows off_t"))?;
        // SAFETY: plain syscall on a descriptor owned by `self.file`.
        let result = unsafe { libc::fallocate(self.file.as_raw_fd(), 0, 0, len) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn raw_extents(&self, start: u64, end: u64) -> PloopResult<Vec<Extent>> {
        fiemap(&self.file, &self.path, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_balloon_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".balloon");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let balloon = Balloon::from_file(File::open(&path).unwrap(), path.clone()).unwrap();
        assert_eq!(balloon.size().unwrap(), 8192);
        assert!(balloon.block_size().unwrap() > 0);

        let err = Balloon::from_file(File::open(&path).unwrap(), path.clone()).unwrap_err();
        assert!(matches!(err, PloopError::Busy(_)));

        drop(balloon);
        Balloon::from_file(File::open(&path).unwrap(), path).unwrap();
    }

    #[test]
    fn test_allocate_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".balloon");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let balloon = Balloon::from_file(file, path).unwrap();

        balloon.allocate(1 << 20).unwrap();
        assert_eq!(balloon.size().unwrap(), 1 << 20);
        balloon.set_len(4096).unwrap();
        balloon.sync().unwrap();
        assert_eq!(balloon.size().unwrap(), 4096);
    }
}
