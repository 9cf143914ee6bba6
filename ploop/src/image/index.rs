//! In-memory copy of a delta's L2 index table.

use ploop_shared::constants::image::{CLUSTER_BITS, HEADER_SLOTS, SLOTS_PER_PAGE};
use ploop_shared::errors::PloopResult;

use super::{Delta, PageBuf};

/// Logical cluster -> physical block mapping of one delta.
///
/// Slots hold sector offsets as stored on disk; zero means unallocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTable {
    l1_pages: u32,
    slots: Vec<u32>,
}

impl IndexTable {
    /// Read every index page of `delta`.
    pub fn load(delta: &Delta) -> PloopResult<Self> {
        let l1_pages = delta.header().l1_pages();
        let mut slots = Vec::with_capacity(delta.header().slot_count() as usize);
        let mut page = PageBuf::new();

        for i in 0..l1_pages {
            delta.read_page(i, &mut page)?;
            let first = if i == 0 { HEADER_SLOTS } else { 0 };
            slots.extend((first..SLOTS_PER_PAGE).map(|pos| page.slot(pos as usize)));
        }

        tracing::debug!(
            image = %delta.path().display(),
            l1_pages,
            mapped = slots.iter().filter(|s| **s != 0).count(),
            "Loaded index table"
        );
        Ok(Self { l1_pages, slots })
    }

    /// Build a table from raw slot values; missing slots are unallocated.
    pub fn from_slots(l1_pages: u32, mut slots: Vec<u32>) -> Self {
        let capacity =
            (l1_pages as usize * SLOTS_PER_PAGE as usize).saturating_sub(HEADER_SLOTS as usize);
        slots.resize(capacity.max(slots.len()), 0);
        Self { l1_pages, slots }
    }

    pub fn l1_pages(&self) -> u32 {
        self.l1_pages
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Physical block backing logical cluster `clu`.
    pub fn lookup(&self, clu: u32) -> Option<u32> {
        match self.slots.get(clu as usize) {
            Some(&sector) if sector != 0 => Some(sector >> CLUSTER_BITS),
            _ => None,
        }
    }

    /// All allocated `(logical cluster, physical block)` pairs in cluster order.
    pub fn mappings(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, sector)| **sector != 0)
            .map(|(clu, sector)| (clu as u32, sector >> CLUSTER_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_mappings() {
        let table = IndexTable::from_slots(1, vec![0, 3 << CLUSTER_BITS, 0, 1 << CLUSTER_BITS]);
        assert_eq!(table.slot_count(), SLOTS_PER_PAGE - HEADER_SLOTS);
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.lookup(1), Some(3));
        assert_eq!(table.lookup(3), Some(1));
        assert_eq!(table.lookup(u32::MAX), None);
        assert_eq!(table.mappings().collect::<Vec<_>>(), vec![(1, 3), (3, 1)]);
    }
}
