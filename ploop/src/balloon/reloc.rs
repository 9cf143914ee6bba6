//! Relocation planning.
//!
//! After the device has frozen the allocation head of the top delta and
//! accepted `n_free` reclaimable blocks, the image can end at
//! `alloc_head - n_free`. Every live block at or past that boundary is moved
//! into the lowest free block below it, so the device can cut the tail off.

use ploop_shared::constants::image::CLUSTER_SIZE;
use ploop_shared::errors::{PloopError, PloopResult};

use super::maps::{BlockOwner, FreeMap, ReverseMap};
use crate::device::{RelocExtent, RelocRequest};

/// Planned block moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationMap {
    /// Frozen allocation head the plan was computed for.
    pub alloc_head: u32,
    /// Number of blocks the device was told are free.
    pub n_free: u32,
    pub extents: Vec<RelocExtent>,
}

impl RelocationMap {
    /// A plan that moves nothing; used to resubmit an interrupted relocation.
    pub fn empty(alloc_head: u32) -> Self {
        Self {
            alloc_head,
            n_free: 0,
            extents: Vec::new(),
        }
    }

    /// New end of the image, in blocks.
    pub fn boundary(&self) -> u32 {
        self.alloc_head - self.n_free.min(self.alloc_head)
    }

    pub fn moved_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.len).sum()
    }

    pub fn to_request(&self, level: u32) -> RelocRequest {
        RelocRequest {
            level,
            alloc_head: self.alloc_head,
            n_free: self.n_free,
            extents: self.extents.clone(),
        }
    }

    fn push(&mut self, clu: u32, iblk: u32, free: u32) {
        match self.extents.last_mut() {
            Some(last)
                if last.clu + last.len == clu
                    && last.iblk + last.len == iblk
                    && last.free + last.len == free =>
            {
                last.len += 1;
            }
            _ => self.extents.push(RelocExtent {
                clu,
                iblk,
                len: 1,
                free,
            }),
        }
    }
}

/// Plan moves of live blocks out of `[alloc_head - n_free, ...)`.
///
/// Destinations are free-map blocks below the boundary, handed out in
/// ascending order. Blocks present in the free map are never treated as live,
/// even when the reverse map (built from the on-disk index) still lists them.
pub fn compute_relocations(
    alloc_head: u32,
    n_free: u32,
    rmap: &ReverseMap,
    free_map: &FreeMap,
) -> PloopResult<RelocationMap> {
    if alloc_head > rmap.len() {
        return Err(PloopError::Format(format!(
            "image corrupted: frozen allocation head {} is beyond the block map ({} blocks)",
            alloc_head,
            rmap.len()
        )));
    }
    if n_free > alloc_head {
        return Err(PloopError::Format(format!(
            "image corrupted: {n_free} free blocks below allocation head {alloc_head}"
        )));
    }

    let mut plan = RelocationMap {
        alloc_head,
        n_free,
        extents: Vec::new(),
    };
    let boundary = plan.boundary();
    let mut destinations = free_map.blocks().take_while(|b| *b < boundary);

    for (iblk, owner) in rmap.iter_range(boundary..rmap.len()) {
        let clu = match owner {
            BlockOwner::Free => continue,
            _ if free_map.contains(iblk) => continue,
            BlockOwner::Data(clu) | BlockOwner::Balloon(clu) => clu,
            BlockOwner::Index => {
                return Err(PloopError::Format(format!(
                    "image corrupted: index page {iblk} lies beyond new image end {boundary}"
                )));
            }
        };
        let Some(dest) = destinations.next() else {
            return Err(PloopError::Format(format!(
                "image corrupted: no free block below {boundary} for block {iblk} (cluster {clu})"
            )));
        };
        plan.push(clu, iblk, dest);
    }

    tracing::debug!(
        alloc_head,
        n_free,
        boundary,
        moved = plan.moved_blocks(),
        bytes = plan.moved_blocks() as u64 * CLUSTER_SIZE,
        "Computed relocations"
    );
    Ok(plan)
}
