//! ploop device control channel.
//!
//! The device exposes four maintenance requests: a balloon handshake that
//! moves it between maintenance modes, loading a free-block list, fetching a
//! staged free-block list back, and relocating blocks. [`ControlDevice`]
//! abstracts the channel so the balloon pipeline runs the same against the
//! real ioctl interface ([`PloopDevice`]) and in-process fakes.

mod ioctl;
mod protocol;
mod state;

pub use ioctl::{PloopDevice, device_name};
pub use protocol::{MaintenanceSession, clear_state, query_state};
pub use state::{Admission, BalloonOp, BusyReason, MaintenanceState};

use ploop_shared::errors::PloopResult;
use serde::Serialize;

/// Balloon handshake request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalloonRequest {
    pub inflate: bool,
    /// Report the current mode without changing it.
    pub keep_intact: bool,
}

impl BalloonRequest {
    /// Request the device to leave maintenance.
    pub fn off() -> Self {
        Self::default()
    }

    pub fn query() -> Self {
        Self {
            inflate: false,
            keep_intact: true,
        }
    }
}

/// What the device reports after a balloon handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalloonReply {
    pub state: MaintenanceState,
    /// Top delta level.
    pub level: u32,
    /// First unused physical block of the top delta.
    pub alloc_head: u32,
}

/// A run of reclaimable blocks: logical clusters `clu..clu+len` backed by
/// physical blocks `iblk..iblk+len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeExtent {
    pub clu: u32,
    pub iblk: u32,
    pub len: u32,
}

/// Free-block list handed to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBlocksRequest {
    pub level: u32,
    pub extents: Vec<FreeExtent>,
}

/// Free-block list staged in the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBlocksList {
    /// Number of extents the device holds, regardless of capacity.
    pub n_extents: u32,
    pub extents: Vec<FreeExtent>,
}

/// A run of live blocks to move: logical clusters `clu..clu+len`, currently
/// at `iblk..iblk+len`, moving to `free..free+len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelocExtent {
    pub clu: u32,
    pub iblk: u32,
    pub len: u32,
    pub free: u32,
}

/// Relocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocRequest {
    pub level: u32,
    pub alloc_head: u32,
    pub n_free: u32,
    pub extents: Vec<RelocExtent>,
}

/// Maintenance requests understood by the ploop device.
pub trait ControlDevice {
    /// Balloon handshake; returns the mode the device is in afterwards.
    fn balloon(&self, request: BalloonRequest) -> PloopResult<BalloonReply>;

    /// Load a free-block list; returns the frozen allocation head.
    fn free_blocks(&self, request: &FreeBlocksRequest) -> PloopResult<u32>;

    /// Fetch up to `capacity` extents of the staged free-block list.
    ///
    /// `capacity == 0` only learns the extent count.
    fn get_free_blocks(&self, level: u32, capacity: u32) -> PloopResult<FreeBlocksList>;

    /// Relocate blocks and truncate the image; returns the number of
    /// reclaimed cluster blocks.
    fn relocate_blocks(&self, request: &RelocRequest) -> PloopResult<u32>;
}

impl<D: ControlDevice + ?Sized> ControlDevice for &D {
    fn balloon(&self, request: BalloonRequest) -> PloopResult<BalloonReply> {
        (**self).balloon(request)
    }

    fn free_blocks(&self, request: &FreeBlocksRequest) -> PloopResult<u32> {
        (**self).free_blocks(request)
    }

    fn get_free_blocks(&self, level: u32, capacity: u32) -> PloopResult<FreeBlocksList> {
        (**self).get_free_blocks(level, capacity)
    }

    fn relocate_blocks(&self, request: &RelocRequest) -> PloopResult<u32> {
        (**self).relocate_blocks(request)
    }
}
