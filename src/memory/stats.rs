//! Diagnostic counters and snapshot types.
//!
//! The process-wide gauges use `Relaxed` ordering. Individual values are
//! eventually consistent; cross-gauge snapshots may be transiently
//! inconsistent. Fine for display, never for allocation decisions (those
//! read the per-pool `free_count`, which is exact).

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers go through `get()`/`load()`, which
/// clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved by pool arenas and page fallbacks
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by pool arenas and page fallbacks
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown
crate::sync::static_atomic! {
    pub static POOL_ARENA_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static POOL_LIVE_SLOTS: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static FALLBACK_BYTES: Counter = Counter::new();
}

/// Point-in-time view of the process-wide gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalGauges {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub pool_arena_bytes: usize,
    pub pool_live_slots: usize,
    pub fallback_bytes: usize,
}

#[must_use]
pub fn global_gauges() -> GlobalGauges {
    GlobalGauges {
        total_reserved: TOTAL_RESERVED.get(),
        total_committed: TOTAL_COMMITTED.get(),
        pool_arena_bytes: POOL_ARENA_BYTES.get(),
        pool_live_slots: POOL_LIVE_SLOTS.get(),
        fallback_bytes: FALLBACK_BYTES.get(),
    }
}

/// Per-pool counters, exact for the owning manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub block_count: usize,
    pub free_count: usize,
    /// Largest number of slots ever simultaneously occupied.
    pub high_water: usize,
    pub allocations: u64,
    pub frees: u64,
    /// False while a lazily created pool has not reserved its arena yet.
    pub reserved: bool,
}

impl PoolStats {
    #[must_use]
    pub fn live(&self) -> usize {
        self.block_count - self.free_count
    }
}

/// Snapshot of one manager's state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub pools: Vec<PoolStats>,
    pub fallback_live: usize,
    pub fallback_bytes: usize,
    /// Requests that spilled to the fallback because their pool was exhausted.
    pub exhaustion_spills: u64,
    /// Double frees, invalid and unknown addresses observed so far.
    pub misuse_events: u64,
}

impl ManagerStats {
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.pools.iter().map(PoolStats::live).sum()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_manager_stats_live_blocks() {
        let stats = ManagerStats {
            pools: vec![
                PoolStats { block_size: 16, block_count: 8, free_count: 5, ..PoolStats::default() },
                PoolStats { block_size: 64, block_count: 4, free_count: 4, ..PoolStats::default() },
            ],
            ..ManagerStats::default()
        };
        assert_eq!(stats.live_blocks(), 3);
    }
}
