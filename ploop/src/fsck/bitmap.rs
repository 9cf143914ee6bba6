//! Block usage set for duplicate and hole detection.

use std::ops::Range;

const WORD_BITS: u32 = u64::BITS;

/// Set of used physical blocks of one image file.
#[derive(Debug, Clone)]
pub struct UsageBitmap {
    words: Vec<u64>,
    len: u32,
}

impl UsageBitmap {
    /// Empty set over blocks `0..len`.
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS) as usize],
            len,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_used(&self, block: u32) -> bool {
        block < self.len && self.words[(block / WORD_BITS) as usize] & bit(block) != 0
    }

    /// Mark `block` used; returns whether it already was.
    ///
    /// Blocks past the end of the set are ignored.
    pub fn mark_used(&mut self, block: u32) -> bool {
        if block >= self.len {
            return false;
        }
        let word = &mut self.words[(block / WORD_BITS) as usize];
        let was_used = *word & bit(block) != 0;
        *word |= bit(block);
        was_used
    }

    pub fn mark_range(&mut self, blocks: Range<u32>) {
        for block in blocks {
            self.mark_used(block);
        }
    }

    /// Maximal runs of unused blocks below `limit`, in ascending order.
    pub fn unset_ranges_below(&self, limit: u32) -> impl Iterator<Item = Range<u32>> + '_ {
        let limit = limit.min(self.len);
        let mut pos = 0;
        std::iter::from_fn(move || {
            let start = self.next_with(pos, limit, false);
            if start >= limit {
                return None;
            }
            let end = self.next_with(start, limit, true);
            pos = end;
            Some(start..end)
        })
    }

    /// First block in `from..limit` whose used bit equals `used`, or `limit`.
    fn next_with(&self, from: u32, limit: u32, used: bool) -> u32 {
        let mut pos = from;
        while pos < limit {
            let idx = pos / WORD_BITS;
            let mut word = self.words[idx as usize];
            if !used {
                word = !word;
            }
            word &= u64::MAX << (pos % WORD_BITS);
            if word != 0 {
                return (idx * WORD_BITS + word.trailing_zeros()).min(limit);
            }
            pos = (idx + 1) * WORD_BITS;
        }
        limit
    }
}

fn bit(block: u32) -> u64 {
    1 << (block % WORD_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mark_reports_previous_use() {
        let mut bitmap = UsageBitmap::new(100);
        assert!(!bitmap.mark_used(70));
        assert!(bitmap.mark_used(70));
        assert!(bitmap.is_used(70));
        assert!(!bitmap.is_used(71));
        assert!(!bitmap.mark_used(500));
        assert!(!bitmap.is_used(500));
    }

    #[test]
    fn test_unset_ranges() {
        let mut bitmap = UsageBitmap::new(200);
        bitmap.mark_range(0..2);
        bitmap.mark_used(5);
        bitmap.mark_range(6..130);
        let holes: Vec<_> = bitmap.unset_ranges_below(140).collect();
        assert_eq!(holes, vec![2..5, 130..140]);
    }

    #[test]
    fn test_full_or_empty_limit() {
        let mut bitmap = UsageBitmap::new(64);
        bitmap.mark_range(0..64);
        assert_eq!(bitmap.unset_ranges_below(64).count(), 0);
        assert_eq!(bitmap.unset_ranges_below(0).count(), 0);
        assert_eq!(UsageBitmap::new(10).unset_ranges_below(1000).collect::<Vec<_>>(), vec![0..10]);
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_exactly_unused_blocks(
            used in proptest::collection::btree_set(0u32..300, 0..150),
            limit in 0u32..320,
        ) {
            let mut bitmap = UsageBitmap::new(300);
            for &b in &used {
                bitmap.mark_used(b);
            }
            let from_ranges: Vec<u32> = bitmap.unset_ranges_below(limit).flatten().collect();
            let expected: Vec<u32> = (0..limit.min(300)).filter(|b| !used.contains(b)).collect();
            prop_assert_eq!(from_ranges, expected);
        }
    }
}
