use std::cell::{Cell, RefCell};
use std::io;
use std::path::{Path, PathBuf};

use ploop::balloon::{BalloonFile, Extent};
use ploop::PloopResult;
use ploop_shared::constants::image::CLUSTER_SIZE;

/// Balloon file whose physical layout is fixed up front.
///
/// Cluster `i` of the file lives at filesystem cluster `layout[i]`; growing
/// past the layout fails with `ENOSPC`.
#[derive(Debug)]
pub struct FakeBalloon {
    path: PathBuf,
    size: Cell<u64>,
    device_id: u64,
    layout: Vec<u64>,
    fail_allocate: Cell<bool>,
    calls: RefCell<Vec<&'static str>>,
}

impl FakeBalloon {
    pub fn new(device_id: u64, layout: Vec<u64>) -> Self {
        Self {
            path: PathBuf::from("/mnt/.balloon"),
            size: Cell::new(0),
            device_id,
            layout,
            fail_allocate: Cell::new(false),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Start out `bytes` long.
    pub fn with_size(self, bytes: u64) -> Self {
        self.size.set(bytes);
        self
    }

    pub fn fail_allocate(&self) {
        self.fail_allocate.set(true);
    }

    pub fn current_size(&self) -> u64 {
        self.size.get()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn capacity(&self) -> u64 {
        self.layout.len() as u64 * CLUSTER_SIZE
    }
}

impl BalloonFile for FakeBalloon {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> PloopResult<u64> {
        Ok(self.size.get())
    }

    fn block_size(&self) -> PloopResult<u64> {
        Ok(4096)
    }

    fn device_id(&self) -> PloopResult<u64> {
        Ok(self.device_id)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.calls.borrow_mut().push("set_len");
        self.size.set(len);
        Ok(())
    }

    fn allocate(&self, len: u64) -> io::Result<()> {
        self.calls.borrow_mut().push("allocate");
        if self.fail_allocate.get() || len > self.capacity() {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        self.size.set(self.size.get().max(len));
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        self.calls.borrow_mut().push("sync");
        Ok(())
    }

    fn raw_extents(&self, start: u64, end: u64) -> PloopResult<Vec<Extent>> {
        let end = end.min(self.size.get());
        let first = start / CLUSTER_SIZE;
        let last = end.div_ceil(CLUSTER_SIZE);
        Ok((first..last)
            .filter_map(|i| {
                self.layout.get(i as usize).map(|&phys| Extent {
                    logical: i * CLUSTER_SIZE,
                    physical: phys * CLUSTER_SIZE,
                    len: CLUSTER_SIZE,
                })
            })
            .collect())
    }
}
