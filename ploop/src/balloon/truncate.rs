//! Balloon resize primitives.
//!
//! Shrinking only has to drop blocks. Growing allocates first and rolls the
//! file back to its old size on any failure, so a half-done inflate never
//! leaves the balloon larger than the device was told about.

use ploop_shared::constants::image::SECTOR_BITS;
use ploop_shared::errors::{IoOp, PloopError, PloopResult};

use super::file::BalloonFile;

/// New balloon size in bytes: `size_sectors` rounded up to `block_size`.
pub fn round_size(size_sectors: u64, block_size: u64) -> PloopResult<u64> {
    let bytes = size_sectors
        .checked_mul(1 << SECTOR_BITS)
        .ok_or_else(|| PloopError::InvalidArgument(format!("size {size_sectors} is too large")))?;
    if block_size == 0 {
        return Ok(bytes);
    }
    bytes
        .checked_next_multiple_of(block_size)
        .ok_or_else(|| PloopError::InvalidArgument(format!("size {size_sectors} is too large")))
}

/// Truncate the balloon from `old_size` down to `new_size` bytes.
pub fn shrink<B: BalloonFile + ?Sized>(balloon: &B, old_size: u64, new_size: u64) -> PloopResult<()> {
    let name = balloon.path().display().to_string();
    if new_size == old_size {
        tracing::info!("Nothing to do: new_size == old_size ({new_size} bytes)");
        return Ok(());
    }

    let truncated = balloon.set_len(new_size);
    let synced = balloon.sync();
    truncated.map_err(|e| PloopError::io(IoOp::Truncate, name.clone(), e))?;
    synced.map_err(|e| PloopError::io(IoOp::Fsync, name.clone(), e))?;

    tracing::info!("Successfully truncated balloon {name} from {old_size} to {new_size} bytes");
    Ok(())
}

/// Why an inflate failed, and whether the device may leave maintenance.
#[derive(Debug)]
pub struct InflateFailure {
    pub error: PloopError,
    /// The balloon is back at its old size (or was never changed), so the
    /// maintenance state can be reset. When false the revert itself failed
    /// and the state is left for manual recovery.
    pub clear_state: bool,
}

/// Grow the balloon to `new_size` bytes; returns the size actually reached.
pub fn inflate<B: BalloonFile + ?Sized>(
    balloon: &B,
    old_size: u64,
    new_size: u64,
) -> Result<u64, InflateFailure> {
    let name = balloon.path().display().to_string();

    if let Err(e) = balloon.allocate(new_size) {
        let error = PloopError::io(IoOp::Fallocate, name.clone(), e);
        return match balloon.size() {
            Ok(size) if size == old_size => Err(InflateFailure {
                error,
                clear_state: true,
            }),
            _ => Err(revert(balloon, old_size, error)),
        };
    }

    let size = match balloon.size() {
        Ok(size) => size,
        Err(error) => return Err(revert(balloon, old_size, error)),
    };
    if size < new_size {
        let error = PloopError::Corrupted(format!(
            "fallocate corrupted balloon {name}? {size} < {new_size}"
        ));
        return Err(revert(balloon, old_size, error));
    }

    balloon.sync().map_err(|e| InflateFailure {
        error: PloopError::io(IoOp::Fsync, name.clone(), e),
        clear_state: true,
    })?;

    tracing::info!("Successfully inflated balloon {name} from {old_size} to {size} bytes");
    Ok(size)
}

fn revert<B: BalloonFile + ?Sized>(balloon: &B, old_size: u64, error: PloopError) -> InflateFailure {
    match balloon.set_len(old_size) {
        Ok(()) => {
            if let Err(e) = balloon.sync() {
                tracing::warn!(error = %e, "fsync after balloon revert failed");
            }
            InflateFailure {
                error,
                clear_state: true,
            }
        }
        Err(e) => {
            tracing::error!(
                balloon = %balloon.path().display(),
                old_size,
                error = %e,
                "Can't revert balloon; leaving maintenance state for manual recovery"
            );
            InflateFailure {
                error,
                clear_state: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balloon::extents::Extent;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::path::{Path, PathBuf};

    #[derive(Default)]
    struct RecordingBalloon {
        path: PathBuf,
        size: Cell<u64>,
        calls: RefCell<Vec<&'static str>>,
        fail_allocate: bool,
        allocate_partially: Option<u64>,
        fail_set_len: bool,
        fail_sync: bool,
        /// `size()` fails once `allocate` has run.
        fail_stat_after_allocate: bool,
        /// Largest size `size()` reports, whatever was allocated.
        size_cap: Option<u64>,
    }

    impl BalloonFile for RecordingBalloon {
        fn path(&self) -> &Path {
            &self.path
        }

        fn size(&self) -> PloopResult<u64> {
            if self.fail_stat_after_allocate && self.calls.borrow().contains(&"allocate") {
                return Err(PloopError::io(
                    IoOp::Stat,
                    self.path.display().to_string(),
                    io::Error::other("EIO"),
                ));
            }
            let size = self.size.get();
            Ok(self.size_cap.map_or(size, |cap| size.min(cap)))
        }

        fn block_size(&self) -> PloopResult<u64> {
            Ok(4096)
        }

        fn device_id(&self) -> PloopResult<u64> {
            Ok(0)
        }

        fn set_len(&self, len: u64) -> io::Result<()> {
            self.calls.borrow_mut().push("set_len");
            if self.fail_set_len {
                return Err(io::Error::other("EIO"));
            }
            self.size.set(len);
            Ok(())
        }

        fn allocate(&self, len: u64) -> io::Result<()> {
            self.calls.borrow_mut().push("allocate");
            if let Some(partial) = self.allocate_partially {
                self.size.set(partial);
            }
            if self.fail_allocate {
                return Err(io::Error::other("ENOSPC"));
            }
            self.size.set(self.size.get().max(len));
            Ok(())
        }

        fn sync(&self) -> io::Result<()> {
            self.calls.borrow_mut().push("sync");
            if self.fail_sync {
                return Err(io::Error::other("EIO"));
            }
            Ok(())
        }

        fn raw_extents(&self, _: u64, _: u64) -> PloopResult<Vec<Extent>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_round_size_to_block() {
        assert_eq!(round_size(1, 4096).unwrap(), 4096);
        assert_eq!(round_size(8, 4096).unwrap(), 4096);
        assert_eq!(round_size(9, 4096).unwrap(), 8192);
        assert_eq!(round_size(0, 4096).unwrap(), 0);
        assert!(round_size(u64::MAX, 4096).is_err());
    }

    #[test]
    fn test_shrink_equal_size_is_noop() {
        let balloon = RecordingBalloon::default();
        balloon.size.set(8192);
        shrink(&balloon, 8192, 8192).unwrap();
        assert!(balloon.calls.borrow().is_empty());
    }

    #[test]
    fn test_shrink_truncates_then_syncs() {
        let balloon = RecordingBalloon::default();
        balloon.size.set(8192);
        shrink(&balloon, 8192, 4096).unwrap();
        assert_eq!(*balloon.calls.borrow(), vec!["set_len", "sync"]);
        assert_eq!(balloon.size.get(), 4096);
    }

    #[test]
    fn test_shrink_syncs_even_when_truncate_fails() {
        let balloon = RecordingBalloon {
            fail_set_len: true,
            ..Default::default()
        };
        let err = shrink(&balloon, 8192, 4096).unwrap_err();
        assert!(matches!(err, PloopError::Io { op: IoOp::Truncate, .. }));
        assert_eq!(*balloon.calls.borrow(), vec!["set_len", "sync"]);
    }

    #[test]
    fn test_inflate_reverts_when_stat_fails() {
        let balloon = RecordingBalloon {
            fail_stat_after_allocate: true,
            ..Default::default()
        };
        let failure = inflate(&balloon, 0, 1 << 20).unwrap_err();
        assert!(matches!(failure.error, PloopError::Io { op: IoOp::Stat, .. }));
        assert!(failure.clear_state);
        assert_eq!(*balloon.calls.borrow(), vec!["allocate", "set_len", "sync"]);
        assert_eq!(balloon.size.get(), 0);
    }

    #[test]
    fn test_inflate_success() {
        let balloon = RecordingBalloon::default();
        assert_eq!(inflate(&balloon, 0, 1 << 20).unwrap(), 1 << 20);
        assert_eq!(*balloon.calls.borrow(), vec!["allocate", "sync"]);
    }

    #[test]
    fn test_inflate_failure_without_change_skips_revert() {
        let balloon = RecordingBalloon {
            fail_allocate: true,
            ..Default::default()
        };
        let failure = inflate(&balloon, 0, 1 << 20).unwrap_err();
        assert!(failure.clear_state);
        assert!(matches!(failure.error, PloopError::Io { op: IoOp::Fallocate, .. }));
        assert_eq!(*balloon.calls.borrow(), vec!["allocate"]);
    }

    #[test]
    fn test_inflate_partial_allocation_reverts() {
        let balloon = RecordingBalloon {
            fail_allocate: true,
            allocate_partially: Some(4096),
            ..Default::default()
        };
        let failure = inflate(&balloon, 0, 1 << 20).unwrap_err();
        assert!(failure.clear_state);
        assert_eq!(balloon.size.get(), 0);
        assert_eq!(*balloon.calls.borrow(), vec!["allocate", "set_len", "sync"]);
    }

    #[test]
    fn test_inflate_short_file_is_corruption() {
        let balloon = RecordingBalloon {
            size_cap: Some(4096),
            ..Default::default()
        };
        let failure = inflate(&balloon, 0, 1 << 20).unwrap_err();
        assert!(matches!(failure.error, PloopError::Corrupted(_)));
        assert!(failure.clear_state);
        assert_eq!(balloon.size.get(), 0);
        assert_eq!(*balloon.calls.borrow(), vec!["allocate", "set_len", "sync"]);
    }

    #[test]
    fn test_failed_revert_keeps_state() {
        let balloon = RecordingBalloon {
            fail_allocate: true,
            allocate_partially: Some(4096),
            fail_set_len: true,
            ..Default::default()
        };
        let failure = inflate(&balloon, 0, 1 << 20).unwrap_err();
        assert!(!failure.clear_state);
    }
}
