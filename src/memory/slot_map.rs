use fixedbitset::FixedBitSet;

/// Occupancy bitmap for a fixed number of slots.
///
/// Bit set = slot occupied. `free_count` always equals the number of clear
/// bits in `0..len`; bits past `len` in the last storage word are never set.
pub(crate) struct SlotBitmap {
    occupied: FixedBitSet,
    free_count: usize,
    /// Every slot below this index is occupied.
    search_hint: usize,
}

#[inline]
fn block_bits<B>(_: &[B]) -> usize {
    std::mem::size_of::<B>() * 8
}

impl SlotBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            occupied: FixedBitSet::with_capacity(len),
            free_count: len,
            search_hint: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub fn is_occupied(&self, index: usize) -> bool {
        self.occupied.contains(index)
    }

    /// Claim the lowest free slot and return its index.
    ///
    /// Scans whole storage words starting at the hint, skipping words with
    /// every bit set.
    pub fn claim_first_free(&mut self) -> Option<usize> {
        if self.free_count == 0 {
            return None;
        }

        let len = self.len();
        let blocks = self.occupied.as_slice();
        let bits = block_bits(blocks);
        let found = blocks
            .iter()
            .enumerate()
            .skip(self.search_hint / bits)
            .find(|(_, word)| !**word != 0)
            .map(|(w, word)| w * bits + (!*word).trailing_zeros() as usize)
            .filter(|&index| index < len);

        let Some(index) = found else {
            debug_assert!(
                false,
                "free_count is {} but no clear bit was found",
                self.free_count
            );
            return None;
        };

        self.occupied.insert(index);
        self.free_count -= 1;
        self.search_hint = index + 1;
        Some(index)
    }

    /// Clear the bit for `index`. Returns `false` if it was already clear.
    pub fn release(&mut self, index: usize) -> bool {
        if !self.occupied.contains(index) {
            return false;
        }
        self.occupied.set(index, false);
        self.free_count += 1;
        self.search_hint = self.search_hint.min(index);
        true
    }

    /// Indices of every occupied slot, ascending.
    pub fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupied.ones()
    }

    /// Recount clear bits from scratch.
    pub fn recount_free(&self) -> usize {
        self.len() - self.occupied.count_ones(..)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_claims_in_ascending_order() {
        let mut map = SlotBitmap::new(5);
        for expected in 0..5 {
            assert_eq!(map.claim_first_free(), Some(expected));
        }
        assert_eq!(map.claim_first_free(), None);
        assert_eq!(map.free_count(), 0);
    }

    #[test]
    fn test_release_rewinds_to_lowest_hole() {
        let mut map = SlotBitmap::new(10);
        for _ in 0..10 {
            map.claim_first_free();
        }
        assert!(map.release(7));
        assert!(map.release(2));
        assert_eq!(map.claim_first_free(), Some(2));
        assert_eq!(map.claim_first_free(), Some(7));
    }

    #[test]
    fn test_release_twice_reports_already_free() {
        let mut map = SlotBitmap::new(4);
        let idx = map.claim_first_free().unwrap();
        assert!(map.release(idx));
        assert!(!map.release(idx));
        assert_eq!(map.free_count(), 4);
    }

    #[test]
    fn test_scan_crosses_full_words() {
        // 200 slots spans several storage words whatever the block width.
        let mut map = SlotBitmap::new(200);
        for _ in 0..199 {
            map.claim_first_free();
        }
        assert_eq!(map.claim_first_free(), Some(199));
        assert!(map.release(130));
        assert_eq!(map.claim_first_free(), Some(130));
        assert_eq!(map.claim_first_free(), None);
    }

    #[test]
    fn test_tail_bits_beyond_len_are_never_claimed() {
        let mut map = SlotBitmap::new(3);
        assert_eq!(map.claim_first_free(), Some(0));
        assert_eq!(map.claim_first_free(), Some(1));
        assert_eq!(map.claim_first_free(), Some(2));
        assert_eq!(map.claim_first_free(), None);
    }

    #[test]
    fn test_recount_matches_cached_free_count() {
        let mut map = SlotBitmap::new(70);
        for _ in 0..40 {
            map.claim_first_free();
        }
        for i in (0..40).step_by(3) {
            map.release(i);
        }
        assert_eq!(map.recount_free(), map.free_count());
        assert_eq!(
            map.occupied_indices().count(),
            map.len() - map.free_count()
        );
    }
}
