use std::cell::{Cell, RefCell};
use std::io;

use ploop::device::{
    BalloonReply, BalloonRequest, ControlDevice, FreeBlocksList, FreeBlocksRequest, FreeExtent,
    RelocRequest,
};
use ploop::{MaintenanceState, PloopError, PloopResult};

/// A request seen by [`FakeDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Balloon(BalloonRequest),
    FreeBlocks(FreeBlocksRequest),
    GetFreeBlocks { level: u32, capacity: u32 },
    Relocate(RelocRequest),
}

/// In-memory ploop device.
///
/// Follows the kernel's maintenance state machine: the balloon handshake only
/// moves between OFF and BALLOON, a loaded free list moves to FBLOADED and a
/// relocation goes through RELOC back to OFF.
#[derive(Debug)]
pub struct FakeDevice {
    state: Cell<MaintenanceState>,
    level: u32,
    alloc_head: Cell<u32>,
    staged: RefCell<Vec<FreeExtent>>,
    pending_reclaim: Cell<u32>,
    fail_relocation: Cell<bool>,
    calls: RefCell<Vec<DeviceCall>>,
}

impl FakeDevice {
    pub fn new(level: u32, alloc_head: u32) -> Self {
        Self {
            state: Cell::new(MaintenanceState::Off),
            level,
            alloc_head: Cell::new(alloc_head),
            staged: RefCell::new(Vec::new()),
            pending_reclaim: Cell::new(0),
            fail_relocation: Cell::new(false),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_state(self, state: MaintenanceState) -> Self {
        self.state.set(state);
        self
    }

    /// Device left in FBLOADED with `extents` staged, as after a crash
    /// following FREEBLKS.
    pub fn with_staged(self, extents: Vec<FreeExtent>) -> Self {
        self.pending_reclaim
            .set(extents.iter().map(|e| e.len).sum());
        *self.staged.borrow_mut() = extents;
        self.with_state(MaintenanceState::FreeBlocksLoaded)
    }

    /// Make the next RELOCBLKS fail after entering RELOC.
    pub fn fail_next_relocation(&self) {
        self.fail_relocation.set(true);
    }

    pub fn state(&self) -> MaintenanceState {
        self.state.get()
    }

    pub fn alloc_head(&self) -> u32 {
        self.alloc_head.get()
    }

    pub fn staged(&self) -> Vec<FreeExtent> {
        self.staged.borrow().clone()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.borrow().clone()
    }

    /// Relocation requests seen so far.
    pub fn relocations(&self) -> Vec<RelocRequest> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Relocate(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    fn reply(&self) -> BalloonReply {
        BalloonReply {
            state: self.state.get(),
            level: self.level,
            alloc_head: self.alloc_head.get(),
        }
    }

    fn reject(request: &'static str) -> PloopError {
        PloopError::ioctl(request, io::Error::from_raw_os_error(libc::EINVAL))
    }
}

impl ControlDevice for FakeDevice {
    fn balloon(&self, request: BalloonRequest) -> PloopResult<BalloonReply> {
        self.calls.borrow_mut().push(DeviceCall::Balloon(request));
        let state = self.state.get();
        if !request.keep_intact && matches!(state, MaintenanceState::Off | MaintenanceState::Balloon) {
            self.state.set(if request.inflate {
                MaintenanceState::Balloon
            } else {
                MaintenanceState::Off
            });
        }
        Ok(self.reply())
    }

    fn free_blocks(&self, request: &FreeBlocksRequest) -> PloopResult<u32> {
        self.calls
            .borrow_mut()
            .push(DeviceCall::FreeBlocks(request.clone()));
        if self.state.get() != MaintenanceState::Balloon || request.level != self.level {
            return Err(Self::reject("PLOOP_IOC_FREEBLKS"));
        }
        *self.staged.borrow_mut() = request.extents.clone();
        self.pending_reclaim
            .set(request.extents.iter().map(|e| e.len).sum());
        self.state.set(MaintenanceState::FreeBlocksLoaded);
        Ok(self.alloc_head.get())
    }

    fn get_free_blocks(&self, level: u32, capacity: u32) -> PloopResult<FreeBlocksList> {
        self.calls
            .borrow_mut()
            .push(DeviceCall::GetFreeBlocks { level, capacity });
        if self.state.get() != MaintenanceState::FreeBlocksLoaded {
            return Err(Self::reject("PLOOP_IOC_FBGET"));
        }
        let staged = self.staged.borrow();
        Ok(FreeBlocksList {
            n_extents: staged.len() as u32,
            extents: staged.iter().take(capacity as usize).copied().collect(),
        })
    }

    fn relocate_blocks(&self, request: &RelocRequest) -> PloopResult<u32> {
        self.calls
            .borrow_mut()
            .push(DeviceCall::Relocate(request.clone()));
        if !matches!(
            self.state.get(),
            MaintenanceState::FreeBlocksLoaded | MaintenanceState::Relocating
        ) {
            return Err(Self::reject("PLOOP_IOC_RELOCBLKS"));
        }
        self.state.set(MaintenanceState::Relocating);
        if self.fail_relocation.replace(false) {
            return Err(PloopError::ioctl(
                "PLOOP_IOC_RELOCBLKS",
                io::Error::from_raw_os_error(libc::EIO),
            ));
        }

        let reclaimed = self.pending_reclaim.replace(0);
        self.alloc_head
            .set(self.alloc_head.get().saturating_sub(reclaimed));
        self.staged.borrow_mut().clear();
        self.state.set(MaintenanceState::Off);
        Ok(reclaimed)
    }
}
