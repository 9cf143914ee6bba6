//! Balloon-based free space reclamation.
//!
//! The guest filesystem holds a hidden, preallocated "balloon" file. Blocks
//! the filesystem gives to the balloon are unused by the guest, so once the
//! balloon grows over them they can be returned to the host:
//!
//! ```text
//! change_size(bigger)
//!   BALLOON handshake (inflate) ─ fallocate balloon ─ FIEMAP new range
//!     ─ reverse map ─ free map ─ FREEBLKS (device freezes alloc head, FBLOADED)
//!     ─ relocation plan ─ RELOCBLKS (device moves blocks, truncates image)
//! ```
//!
//! Shrinking the balloon only truncates the file. An operation interrupted
//! after FREEBLKS leaves the device in FBLOADED or RELOC; [`BalloonManager::complete`]
//! picks it up from the device's own state.

pub mod extents;
mod file;
pub mod maps;
pub mod reloc;
pub mod truncate;

pub use extents::{Extent, map_extents};
pub use file::{Balloon, BalloonFile};
pub use maps::{BlockOwner, FreeMap, ReverseMap, build_reverse_map, derive_free_map};
pub use reloc::{RelocationMap, compute_relocations};

use ploop_shared::constants::format;
use ploop_shared::constants::image::{CLUSTER_SIZE, SECTOR_BITS};
use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

use crate::device::{
    Admission, BalloonOp, BalloonReply, ControlDevice, MaintenanceSession, MaintenanceState,
    clear_state, query_state,
};
use crate::image::{Delta, IndexTable};
use crate::lock::GlobalLock;
use crate::options::PloopOptions;
use crate::sysfs::SysfsTopology;

/// Result of [`BalloonManager::change_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// The requested size equals the current one.
    Unchanged { size: u64 },
    Truncated { old_size: u64, new_size: u64 },
    Inflated {
        old_size: u64,
        new_size: u64,
        /// Cluster blocks removed from the image.
        reclaimed: u32,
    },
}

/// Result of [`BalloonManager::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompleteOutcome {
    NothingToComplete { state: MaintenanceState },
    Completed { reclaimed: u32 },
}

/// Result of [`BalloonManager::check_and_repair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RepairOutcome {
    EmptyBalloon,
    NoFreeBlocks,
    /// Check only: blocks that `repair` would reclaim.
    Found { free_blocks: u32 },
    Repaired { free_blocks: u32, reclaimed: u32 },
}

/// Balloon operations against one ploop device.
pub struct BalloonManager<D: ControlDevice> {
    device: D,
    device_name: String,
    topology: SysfsTopology,
    options: PloopOptions,
}

impl<D: ControlDevice> BalloonManager<D> {
    /// `device_name` is the kernel name (`ploop12345`) used for sysfs lookups.
    pub fn new(device: D, device_name: impl Into<String>, options: PloopOptions) -> Self {
        let topology = SysfsTopology::new(&options.sysfs_root);
        Self {
            device,
            device_name: device_name.into(),
            topology,
            options,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Current maintenance state, level and allocation head.
    pub fn state(&self) -> PloopResult<BalloonReply> {
        query_state(&self.device)
    }

    /// Drop a stale maintenance state.
    pub fn clear_state(&self) -> PloopResult<()> {
        clear_state(&self.device)
    }

    /// Resize `balloon` to `new_size_sectors`, reclaiming the image blocks a
    /// bigger balloon covers.
    pub fn change_size<B: BalloonFile + ?Sized>(
        &self,
        balloon: &B,
        new_size_sectors: u64,
    ) -> PloopResult<ChangeOutcome> {
        let old_size = balloon.size()?;
        let new_size = truncate::round_size(new_size_sectors, balloon.block_size()?)?;

        if new_size <= old_size {
            let _session = MaintenanceSession::begin(&self.device, BalloonOp::Truncate)?;
            truncate::shrink(balloon, old_size, new_size)?;
            return Ok(if new_size == old_size {
                ChangeOutcome::Unchanged { size: old_size }
            } else {
                ChangeOutcome::Truncated { old_size, new_size }
            });
        }

        let mut session = MaintenanceSession::begin(&self.device, BalloonOp::Inflate)?;
        let level = session.grant().level;
        let base = self.partition_offset(balloon)?;
        let index = self.load_top_index()?;

        let size = match truncate::inflate(balloon, old_size, new_size) {
            Ok(size) => size,
            Err(failure) => {
                if !failure.clear_state {
                    session.disarm();
                }
                return Err(failure.error);
            }
        };

        let extents = map_extents(balloon, base, old_size, size)?;
        let rmap = build_reverse_map(&extents, &index)?;
        let (free_map, used) = derive_free_map(&rmap, 0..rmap.len());
        if used == 0 {
            tracing::info!("No unused cluster blocks found");
            return Ok(ChangeOutcome::Inflated {
                old_size,
                new_size: size,
                reclaimed: 0,
            });
        }

        let reclaimed = self.reclaim(&mut session, level, &rmap, &free_map)?;
        Ok(ChangeOutcome::Inflated {
            old_size,
            new_size: size,
            reclaimed,
        })
    }

    /// Finish a balloon operation interrupted after the free list was loaded.
    pub fn complete(&self) -> PloopResult<CompleteOutcome> {
        let session = MaintenanceSession::begin(&self.device, BalloonOp::Complete)?;
        let grant = *session.grant();

        if session.admission() == Admission::NothingToDo {
            tracing::info!("Nothing to complete: kernel is in {} state", grant.state);
            return Ok(CompleteOutcome::NothingToComplete { state: grant.state });
        }

        let plan = match grant.state {
            MaintenanceState::Relocating => RelocationMap::empty(grant.alloc_head),
            _ => self.plan_from_staged_list(&grant)?,
        };
        let reclaimed = self.submit(grant.level, &plan)?;
        Ok(CompleteOutcome::Completed { reclaimed })
    }

    /// Look for balloon blocks still allocated in the image; reclaim them
    /// when `repair` is set.
    pub fn check_and_repair<B: BalloonFile + ?Sized>(
        &self,
        balloon: &B,
        repair: bool,
    ) -> PloopResult<RepairOutcome> {
        let size = balloon.size()?;
        if size == 0 {
            tracing::info!("Nothing to do: hidden balloon is empty");
            return Ok(RepairOutcome::EmptyBalloon);
        }

        let op = if repair { BalloonOp::Repair } else { BalloonOp::Check };
        let mut session = MaintenanceSession::begin(&self.device, op)?;
        let level = session.grant().level;
        let base = self.partition_offset(balloon)?;
        let index = self.load_top_index()?;

        let extents = map_extents(balloon, base, 0, size)?;
        let rmap = build_reverse_map(&extents, &index)?;
        let (free_map, used) = derive_free_map(&rmap, 0..rmap.len());
        if used == 0 {
            tracing::info!("No free blocks found");
            return Ok(RepairOutcome::NoFreeBlocks);
        }

        let free_blocks = free_map.n_blocks();
        if !repair {
            tracing::info!("Found {free_blocks} free blocks. Consider using balloon repair");
            return Ok(RepairOutcome::Found { free_blocks });
        }

        let reclaimed = self.reclaim(&mut session, level, &rmap, &free_map)?;
        Ok(RepairOutcome::Repaired {
            free_blocks,
            reclaimed,
        })
    }

    /// Hand `free_map` to the device and relocate what blocks the tail.
    fn reclaim(
        &self,
        session: &mut MaintenanceSession<'_, D>,
        level: u32,
        rmap: &ReverseMap,
        free_map: &FreeMap,
    ) -> PloopResult<u32> {
        let alloc_head = self.device.free_blocks(&free_map.to_request(level))?;
        // The device now holds the free list; `complete` resumes from here.
        session.disarm();

        let plan = compute_relocations(alloc_head, free_map.n_blocks(), rmap, free_map)?;
        self.submit(level, &plan)
    }

    fn plan_from_staged_list(&self, grant: &BalloonReply) -> PloopResult<RelocationMap> {
        let counts = self.device.get_free_blocks(grant.level, 0)?;
        if counts.n_extents == 0 {
            return Ok(RelocationMap::empty(grant.alloc_head));
        }
        let staged = self.device.get_free_blocks(grant.level, counts.n_extents)?;
        let free_map = FreeMap::from_extents(staged.extents)?;

        let index = self.load_top_index()?;
        let rmap = ReverseMap::from_index(&index)?;
        compute_relocations(grant.alloc_head, free_map.n_blocks(), &rmap, &free_map)
    }

    fn submit(&self, level: u32, plan: &RelocationMap) -> PloopResult<u32> {
        let reclaimed = self.device.relocate_blocks(&plan.to_request(level))?;
        tracing::info!(
            "TRUNCATED: {} cluster-blocks ({} bytes)",
            reclaimed,
            reclaimed as u64 * CLUSTER_SIZE
        );
        Ok(reclaimed)
    }

    /// Byte offset of the balloon's filesystem inside the ploop device.
    fn partition_offset<B: BalloonFile + ?Sized>(&self, balloon: &B) -> PloopResult<u64> {
        let start = self.topology.partition_start(balloon.device_id()?)?;
        Ok((start as u64) << SECTOR_BITS)
    }

    fn load_top_index(&self) -> PloopResult<IndexTable> {
        let top = {
            let _lock = GlobalLock::acquire(&self.options.global_lock_path())?;
            self.topology.top_delta(&self.device_name)?
        };
        if top.format == format::RAW {
            return Err(PloopError::Unsupported(format!(
                "balloon is not supported for {} format delta {}",
                top.format,
                top.image.display()
            )));
        }
        let delta = Delta::open(&top.image, self.options.direct_io)?;
        IndexTable::load(&delta)
    }
}
