//! Reverse and free block maps.
//!
//! The reverse map answers "who owns physical block N of the top delta":
//! nobody, the index itself, a logical cluster with live data, or a logical
//! cluster that belongs to the balloon and can be given back. The free map is
//! the reclaimable subset, as coalesced runs the device accepts.

use std::ops::Range;

use ploop_shared::errors::{PloopError, PloopResult};

use super::extents::Extent;
use crate::device::{FreeBlocksRequest, FreeExtent};
use crate::image::IndexTable;

/// Owner of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOwner {
    /// Not referenced by the index.
    Free,
    /// An index page.
    Index,
    /// Live data of a logical cluster.
    Data(u32),
    /// Mapped for a logical cluster inside the balloon.
    Balloon(u32),
}

impl BlockOwner {
    pub fn logical(&self) -> Option<u32> {
        match *self {
            BlockOwner::Data(clu) | BlockOwner::Balloon(clu) => Some(clu),
            BlockOwner::Free | BlockOwner::Index => None,
        }
    }
}

/// Physical block -> owner, for blocks `0..2 * slot_count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseMap {
    blocks: Vec<BlockOwner>,
}

impl ReverseMap {
    /// Reverse map of every block the index references.
    pub fn from_index(index: &IndexTable) -> PloopResult<Self> {
        let len = index.slot_count() as usize * 2;
        let mut blocks = vec![BlockOwner::Free; len];
        for page in blocks.iter_mut().take(index.l1_pages() as usize) {
            *page = BlockOwner::Index;
        }

        for (clu, iblk) in index.mappings() {
            let Some(block) = blocks.get_mut(iblk as usize) else {
                return Err(PloopError::Format(format!(
                    "cluster {clu} maps to block {iblk} beyond the block map ({len} blocks)"
                )));
            };
            match *block {
                BlockOwner::Free => *block = BlockOwner::Data(clu),
                BlockOwner::Index => {
                    return Err(PloopError::Format(format!(
                        "cluster {clu} maps onto index page {iblk}"
                    )));
                }
                BlockOwner::Data(other) | BlockOwner::Balloon(other) => {
                    return Err(PloopError::Format(format!(
                        "block {iblk} is owned by both cluster {other} and cluster {clu}"
                    )));
                }
            }
        }
        Ok(Self { blocks })
    }

    /// Attribute blocks backing the balloon `extents` to the balloon.
    pub fn mark_balloon(&mut self, extents: &[Extent], index: &IndexTable) -> PloopResult<()> {
        let slots = index.slot_count() as u64;
        for extent in extents {
            for clu in extent.clusters() {
                if clu >= slots {
                    return Err(PloopError::Format(format!(
                        "balloon cluster {clu} is beyond the image index ({slots} slots)"
                    )));
                }
                let clu = clu as u32;
                if let Some(iblk) = index.lookup(clu) {
                    self.blocks[iblk as usize] = BlockOwner::Balloon(clu);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn owner(&self, iblk: u32) -> BlockOwner {
        self.blocks
            .get(iblk as usize)
            .copied()
            .unwrap_or(BlockOwner::Free)
    }

    /// `(physical block, owner)` pairs of `range`, clipped to the map.
    pub fn iter_range(&self, range: Range<u32>) -> impl Iterator<Item = (u32, BlockOwner)> + '_ {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        (start..end).map(move |iblk| (iblk, self.blocks[iblk as usize]))
    }
}

/// Reverse map of `index` with the blocks under `extents` given to the
/// balloon.
pub fn build_reverse_map(extents: &[Extent], index: &IndexTable) -> PloopResult<ReverseMap> {
    let mut rmap = ReverseMap::from_index(index)?;
    rmap.mark_balloon(extents, index)?;
    Ok(rmap)
}

/// Reclaimable block runs, sorted by physical block. No run ends past
/// `u32::MAX` in either block or cluster space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeMap {
    extents: Vec<FreeExtent>,
}

impl FreeMap {
    /// Free map from an extent list reported by the device.
    pub fn from_extents(mut extents: Vec<FreeExtent>) -> PloopResult<Self> {
        extents.retain(|e| e.len != 0);
        if let Some(e) = extents
            .iter()
            .find(|e| e.iblk.checked_add(e.len).is_none() || e.clu.checked_add(e.len).is_none())
        {
            return Err(PloopError::Format(format!(
                "free block run of {} at block {} cluster {} is out of range",
                e.len, e.iblk, e.clu
            )));
        }
        extents.sort_by_key(|e| e.iblk);
        for pair in extents.windows(2) {
            if pair[0].iblk + pair[0].len > pair[1].iblk {
                return Err(PloopError::Format(format!(
                    "free block runs overlap at block {}",
                    pair[1].iblk
                )));
            }
        }
        Ok(Self { extents })
    }

    pub fn extents(&self) -> &[FreeExtent] {
        &self.extents
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total number of free blocks.
    pub fn n_blocks(&self) -> u32 {
        self.extents.iter().map(|e| e.len).sum()
    }

    pub fn contains(&self, iblk: u32) -> bool {
        let i = self.extents.partition_point(|e| e.iblk + e.len <= iblk);
        self.extents.get(i).is_some_and(|e| e.iblk <= iblk)
    }

    /// Free physical blocks in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.extents.iter().flat_map(|e| e.iblk..e.iblk + e.len)
    }

    pub fn to_request(&self, level: u32) -> FreeBlocksRequest {
        FreeBlocksRequest {
            level,
            extents: self.extents.clone(),
        }
    }
}

/// Collect balloon-owned blocks of `region` into a free map.
///
/// Returns the map and the number of runs in it; zero runs means nothing is
/// reclaimable.
pub fn derive_free_map(rmap: &ReverseMap, region: Range<u32>) -> (FreeMap, u32) {
    let mut extents: Vec<FreeExtent> = Vec::new();

    for (iblk, owner) in rmap.iter_range(region) {
        let BlockOwner::Balloon(clu) = owner else {
            continue;
        };
        match extents.last_mut() {
            Some(last) if last.iblk + last.len == iblk && last.clu + last.len == clu => {
                last.len += 1;
            }
            _ => extents.push(FreeExtent { clu, iblk, len: 1 }),
        }
    }

    let used = extents.len() as u32;
    (FreeMap { extents }, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ploop_shared::constants::image::{CLUSTER_BITS, CLUSTER_SIZE};
    use proptest::prelude::*;

    fn index(pairs: &[(u32, u32)]) -> IndexTable {
        let mut slots = vec![0u32; 64];
        for &(clu, iblk) in pairs {
            slots[clu as usize] = iblk << CLUSTER_BITS;
        }
        IndexTable::from_slots(1, slots)
    }

    fn balloon(clusters: Range<u64>) -> Extent {
        Extent {
            logical: 0,
            physical: clusters.start * CLUSTER_SIZE,
            len: (clusters.end - clusters.start) * CLUSTER_SIZE,
        }
    }

    #[test]
    fn test_from_index_attributes_owners() {
        let rmap = ReverseMap::from_index(&index(&[(0, 1), (7, 2)])).unwrap();
        assert_eq!(rmap.owner(0), BlockOwner::Index);
        assert_eq!(rmap.owner(1), BlockOwner::Data(0));
        assert_eq!(rmap.owner(2), BlockOwner::Data(7));
        assert_eq!(rmap.owner(3), BlockOwner::Free);
        assert_eq!(rmap.len(), 2 * rmap_slots());
    }

    fn rmap_slots() -> u32 {
        index(&[]).slot_count()
    }

    #[test]
    fn test_double_ownership_is_rejected() {
        let err = ReverseMap::from_index(&index(&[(3, 5), (9, 5)])).unwrap_err();
        assert!(err.to_string().contains("owned by both cluster 3 and cluster 9"));
    }

    #[test]
    fn test_mapping_onto_index_page_is_rejected() {
        let err = ReverseMap::from_index(&index(&[(3, 0)])).unwrap_err();
        assert!(err.to_string().contains("index page"));
    }

    #[test]
    fn test_balloon_blocks_become_free_runs() {
        // Clusters 10..13 are inside the balloon; 12 is not allocated.
        let idx = index(&[(0, 1), (10, 4), (11, 5), (13, 6), (20, 2)]);
        let rmap = build_reverse_map(&[balloon(10..14)], &idx).unwrap();
        assert_eq!(rmap.owner(4), BlockOwner::Balloon(10));
        assert_eq!(rmap.owner(2), BlockOwner::Data(20));

        let (free, used) = derive_free_map(&rmap, 0..rmap.len());
        assert_eq!(used, 2);
        assert_eq!(
            free.extents(),
            &[
                FreeExtent { clu: 10, iblk: 4, len: 2 },
                FreeExtent { clu: 13, iblk: 6, len: 1 },
            ]
        );
        assert_eq!(free.n_blocks(), 3);
        assert!(free.contains(5));
        assert!(!free.contains(3));
        assert_eq!(free.blocks().collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[test]
    fn test_no_reclaimable_blocks() {
        let idx = index(&[(0, 1), (1, 2)]);
        let rmap = build_reverse_map(&[balloon(30..32)], &idx).unwrap();
        let (free, used) = derive_free_map(&rmap, 0..rmap.len());
        assert_eq!(used, 0);
        assert!(free.is_empty());
    }

    #[test]
    fn test_region_limits_free_map() {
        let idx = index(&[(10, 4), (11, 8)]);
        let rmap = build_reverse_map(&[balloon(10..12)], &idx).unwrap();
        let (free, used) = derive_free_map(&rmap, 5..u32::MAX);
        assert_eq!(used, 1);
        assert_eq!(free.extents()[0].iblk, 8);
    }

    #[test]
    fn test_balloon_beyond_index_is_rejected() {
        let idx = index(&[]);
        let slots = idx.slot_count() as u64;
        assert!(build_reverse_map(&[balloon(slots..slots + 1)], &idx).is_err());
    }

    #[test]
    fn test_free_map_from_device_list() {
        let map = FreeMap::from_extents(vec![
            FreeExtent { clu: 9, iblk: 20, len: 2 },
            FreeExtent { clu: 1, iblk: 3, len: 1 },
            FreeExtent { clu: 5, iblk: 8, len: 0 },
        ])
        .unwrap();
        assert_eq!(map.extents().len(), 2);
        assert_eq!(map.extents()[0].iblk, 3);

        let overlap = FreeMap::from_extents(vec![
            FreeExtent { clu: 0, iblk: 3, len: 4 },
            FreeExtent { clu: 9, iblk: 5, len: 1 },
        ]);
        assert!(overlap.is_err());
    }

    #[test]
    fn test_free_map_rejects_wrapping_runs() {
        let past_end = FreeMap::from_extents(vec![FreeExtent {
            clu: 0,
            iblk: u32::MAX - 1,
            len: 4,
        }]);
        assert!(matches!(past_end, Err(PloopError::Format(_))));

        let cluster_wrap = FreeMap::from_extents(vec![FreeExtent {
            clu: u32::MAX,
            iblk: 10,
            len: 2,
        }]);
        assert!(matches!(cluster_wrap, Err(PloopError::Format(_))));

        let map = FreeMap::from_extents(vec![FreeExtent {
            clu: 0,
            iblk: u32::MAX - 4,
            len: 4,
        }])
        .unwrap();
        assert!(map.contains(u32::MAX - 1));
        assert!(!map.contains(u32::MAX));
        assert_eq!(map.blocks().last(), Some(u32::MAX - 1));
    }

    proptest! {
        #[test]
        fn prop_every_block_has_at_most_one_owner(
            blocks in proptest::sample::subsequence((1u32..128).collect::<Vec<_>>(), 0..40),
            in_balloon in proptest::collection::vec(any::<bool>(), 40),
        ) {
            // Distinct physical blocks for clusters 0..n, so the index is consistent.
            let pairs: Vec<(u32, u32)> = blocks.iter().enumerate().map(|(c, b)| (c as u32, *b)).collect();
            let idx = index(&pairs);
            let extents: Vec<Extent> = in_balloon
                .iter()
                .enumerate()
                .filter(|(_, b)| **b)
                .map(|(c, _)| balloon(c as u64..c as u64 + 1))
                .collect();
            let rmap = build_reverse_map(&extents, &idx).unwrap();

            for (clu, iblk) in &pairs {
                let owner = rmap.owner(*iblk);
                prop_assert_eq!(owner.logical(), Some(*clu));
                prop_assert_eq!(
                    matches!(owner, BlockOwner::Balloon(_)),
                    in_balloon[*clu as usize]
                );
            }
            let owned = rmap.iter_range(0..rmap.len()).filter(|(_, o)| o.logical().is_some()).count();
            prop_assert_eq!(owned, pairs.len());

            let (free, used) = derive_free_map(&rmap, 0..rmap.len());
            prop_assert_eq!(used as usize, free.extents().len());
            for b in free.blocks() {
                prop_assert!(matches!(rmap.owner(b), BlockOwner::Balloon(_)));
            }
        }
    }
}
