use super::block_pool::slot_align_for;
use super::error::MemError;

/// One configured size class: `block_count` slots of `block_size` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SizeClassConfig {
    pub block_size: usize,
    pub block_count: usize,
}

impl SizeClassConfig {
    #[must_use]
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    /// Classes `min, 2*min, 4*min, ... <= max`, each with `block_count` slots.
    ///
    /// The list is empty when `min` is zero or not a power of two, which
    /// [`SizeClassRegistry::new`] rejects as `InvalidConfig`.
    #[must_use]
    pub fn powers_of_two(min: usize, max: usize, block_count: usize) -> Vec<Self> {
        if !min.is_power_of_two() {
            log::warn!("smallest class ({min}) must be a non-zero power of two");
            return Vec::new();
        }
        std::iter::successors(Some(min), |&size| size.checked_mul(2))
            .take_while(|&size| size <= max)
            .map(|size| Self::new(size, block_count))
            .collect()
    }
}

/// Handle of a pool inside one manager: its position in the ascending
/// class list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub(crate) usize);

impl PoolId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Outcome of mapping a request size onto the configured classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Pool(PoolId),
    UseFallback,
}

/// Fixed, ascending list of size classes.
///
/// Built once; there is no way to add or reshape a class afterwards, which
/// keeps every pool's address range stable for the manager's lifetime.
#[derive(Clone, Debug)]
pub struct SizeClassRegistry {
    classes: Box<[SizeClassConfig]>,
}

impl SizeClassRegistry {
    /// # Errors
    ///
    /// `InvalidConfig` when the list is empty, contains a zero dimension, is
    /// not strictly ascending by block size, or a class's arena size
    /// overflows.
    pub fn new(classes: &[SizeClassConfig]) -> Result<Self, MemError> {
        if classes.is_empty() {
            return Err(MemError::InvalidConfig(
                "at least one size class is required".to_string(),
            ));
        }
        for class in classes {
            if class.block_size == 0 || class.block_count == 0 {
                return Err(MemError::InvalidConfig(format!(
                    "size class {class:?} has a zero dimension"
                )));
            }
            if class.block_size.checked_mul(class.block_count).is_none() {
                return Err(MemError::InvalidConfig(format!(
                    "size class {class:?} arena size overflows"
                )));
            }
        }
        if let Some(pair) = classes
            .windows(2)
            .find(|pair| pair[0].block_size >= pair[1].block_size)
        {
            return Err(MemError::InvalidConfig(format!(
                "size classes must be strictly ascending, found {} before {}",
                pair[0].block_size, pair[1].block_size
            )));
        }
        Ok(Self {
            classes: classes.into(),
        })
    }

    /// Smallest class whose block size is at least `requested` bytes.
    ///
    /// A zero-byte request is served as a one-byte request.
    #[must_use]
    pub fn resolve(&self, requested: usize) -> Resolution {
        let requested = requested.max(1);
        let idx = self
            .classes
            .partition_point(|class| class.block_size < requested);
        if idx < self.classes.len() {
            Resolution::Pool(PoolId(idx))
        } else {
            Resolution::UseFallback
        }
    }

    /// Like [`resolve`](Self::resolve), but skips classes whose slots cannot
    /// satisfy `align`.
    #[must_use]
    pub fn resolve_aligned(&self, requested: usize, align: usize) -> Resolution {
        let Resolution::Pool(PoolId(first)) = self.resolve(requested) else {
            return Resolution::UseFallback;
        };
        self.classes[first..]
            .iter()
            .position(|class| slot_align_for(class.block_size) >= align)
            .map_or(Resolution::UseFallback, |offset| {
                Resolution::Pool(PoolId(first + offset))
            })
    }

    #[must_use]
    pub fn class(&self, id: PoolId) -> SizeClassConfig {
        self.classes[id.0]
    }

    #[must_use]
    pub fn block_size(&self, id: PoolId) -> usize {
        self.classes[id.0].block_size
    }

    #[must_use]
    pub fn classes(&self) -> &[SizeClassConfig] {
        &self.classes
    }

    pub fn ids(&self) -> impl Iterator<Item = PoolId> + use<> {
        (0..self.classes.len()).map(PoolId)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    #[must_use]
    pub fn largest_block_size(&self) -> usize {
        self.classes.last().map_or(0, |class| class.block_size)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn registry(sizes: &[usize]) -> SizeClassRegistry {
        let classes: Vec<_> = sizes.iter().map(|&s| SizeClassConfig::new(s, 4)).collect();
        SizeClassRegistry::new(&classes).unwrap()
    }

    #[test]
    fn test_resolve_rounds_up_to_next_class() {
        let reg = registry(&[16, 64, 256]);
        assert_eq!(reg.resolve(50), Resolution::Pool(PoolId(1)));
        assert_eq!(reg.block_size(PoolId(1)), 64);
    }

    #[test]
    fn test_resolve_exact_boundaries() {
        let reg = registry(&[16, 64, 256]);
        assert_eq!(reg.resolve(16), Resolution::Pool(PoolId(0)));
        assert_eq!(reg.resolve(17), Resolution::Pool(PoolId(1)));
        assert_eq!(reg.resolve(64), Resolution::Pool(PoolId(1)));
        assert_eq!(reg.resolve(65), Resolution::Pool(PoolId(2)));
        assert_eq!(reg.resolve(256), Resolution::Pool(PoolId(2)));
    }

    #[test]
    fn test_resolve_oversized_uses_fallback() {
        let reg = registry(&[16, 64, 256]);
        assert_eq!(reg.resolve(257), Resolution::UseFallback);
        assert_eq!(reg.resolve(usize::MAX), Resolution::UseFallback);
    }

    #[test]
    fn test_resolve_zero_is_smallest_class() {
        let reg = registry(&[16, 64]);
        assert_eq!(reg.resolve(0), Resolution::Pool(PoolId(0)));
    }

    #[test]
    fn test_resolve_aligned_skips_underaligned_classes() {
        let reg = registry(&[24, 48, 64]);
        // 24-byte slots are only 8-aligned, 48-byte slots 16-aligned
        assert_eq!(reg.resolve_aligned(20, 8), Resolution::Pool(PoolId(0)));
        assert_eq!(reg.resolve_aligned(20, 16), Resolution::Pool(PoolId(1)));
        assert_eq!(reg.resolve_aligned(20, 32), Resolution::Pool(PoolId(2)));
        assert_eq!(reg.resolve_aligned(20, 128), Resolution::UseFallback);
    }

    #[test]
    fn test_rejects_unsorted_or_duplicate_classes() {
        let unsorted = [SizeClassConfig::new(64, 1), SizeClassConfig::new(16, 1)];
        assert!(matches!(
            SizeClassRegistry::new(&unsorted),
            Err(MemError::InvalidConfig(_))
        ));
        let dup = [SizeClassConfig::new(16, 1), SizeClassConfig::new(16, 2)];
        assert!(SizeClassRegistry::new(&dup).is_err());
    }

    #[test]
    fn test_rejects_empty_and_zero_dimensions() {
        assert!(SizeClassRegistry::new(&[]).is_err());
        assert!(SizeClassRegistry::new(&[SizeClassConfig::new(0, 4)]).is_err());
        assert!(SizeClassRegistry::new(&[SizeClassConfig::new(16, 0)]).is_err());
    }

    #[test]
    fn test_powers_of_two_preset() {
        let classes = SizeClassConfig::powers_of_two(16, 300, 10);
        let sizes: Vec<_> = classes.iter().map(|c| c.block_size).collect();
        assert_eq!(sizes, vec![16, 32, 64, 128, 256]);
        assert!(classes.iter().all(|c| c.block_count == 10));
        assert!(SizeClassRegistry::new(&classes).is_ok());
    }

    #[test]
    fn test_powers_of_two_bad_min_is_invalid_config() {
        for min in [0, 24] {
            let classes = SizeClassConfig::powers_of_two(min, 512, 10);
            assert!(classes.is_empty(), "min {min}");
            assert!(matches!(
                SizeClassRegistry::new(&classes),
                Err(MemError::InvalidConfig(_))
            ));
        }
    }
}
