use super::config::{ExhaustionPolicy, LeakPolicy, ManagerConfig, MisusePolicy};
use super::diagnostics::{self, AllocationRecord, TeardownReport};
use super::error::MemError;
use super::fallback::{FallbackAllocator, SystemFallback};
use super::manager::{FallbackShard, PoolShard, report_misuse};
use super::size_class::{Resolution, SizeClassRegistry};
use super::stats::ManagerStats;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Mutex, lock};
use std::alloc::Layout;
use std::panic::Location;
use std::ptr::NonNull;

/// Address range of one arena, captured once so routing needs no lock.
#[derive(Clone, Copy, Debug)]
struct ArenaRange {
    base: usize,
    end: usize,
    block_size: usize,
}

impl ArenaRange {
    fn owns(&self, addr: usize) -> bool {
        (self.base..self.end).contains(&addr) && (addr - self.base).is_multiple_of(self.block_size)
    }
}

/// Thread-safe manager: same surface as [`MemoryManager`](super::manager::MemoryManager)
/// on `&self`.
///
/// Each pool and its slice of the leak tracker sit behind their own mutex,
/// so threads working in different size classes never contend. Pools are
/// always reserved up front (`lazy_pools` is ignored).
pub struct SharedMemoryManager {
    registry: SizeClassRegistry,
    shards: Box<[Mutex<PoolShard>]>,
    ranges: Box<[ArenaRange]>,
    fallback: Mutex<FallbackShard<dyn FallbackAllocator + Send>>,
    exhaustion_policy: ExhaustionPolicy,
    misuse_policy: MisusePolicy,
    leak_policy: LeakPolicy,
    next_sequence: AtomicU64,
    exhaustion_spills: AtomicU64,
    misuse_events: AtomicU64,
    torn_down: bool,
}

impl SharedMemoryManager {
    /// # Errors
    ///
    /// `InvalidConfig` for a bad size-class list, `Vm` if an arena cannot be
    /// reserved.
    pub fn new(config: ManagerConfig) -> Result<Self, MemError> {
        Self::with_fallback(config, SystemFallback::new())
    }

    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_fallback(
        config: ManagerConfig,
        fallback: impl FallbackAllocator + Send + 'static,
    ) -> Result<Self, MemError> {
        let registry = SizeClassRegistry::new(&config.size_classes)?;
        let mut shards = Vec::with_capacity(registry.len());
        let mut ranges = Vec::with_capacity(registry.len());
        for id in registry.ids() {
            let shard = PoolShard::new(id, registry.class(id), true, config.poison_freed)?;
            let (base, end) = shard.range().ok_or_else(|| {
                MemError::Corrupted(format!("eager pool #{} has no arena", id.index()))
            })?;
            ranges.push(ArenaRange {
                base,
                end,
                block_size: registry.block_size(id),
            });
            shards.push(Mutex::new(shard));
        }

        log::debug!(
            "shared memory manager up: {} size class(es) up to {} bytes, {} fallback",
            registry.len(),
            registry.largest_block_size(),
            fallback.name()
        );

        let fallback: Box<dyn FallbackAllocator + Send> = Box::new(fallback);
        Ok(Self {
            registry,
            shards: shards.into_boxed_slice(),
            ranges: ranges.into_boxed_slice(),
            fallback: Mutex::new(FallbackShard::new(fallback)),
            exhaustion_policy: config.exhaustion_policy,
            misuse_policy: config.misuse_policy,
            leak_policy: config.leak_policy,
            next_sequence: AtomicU64::new(0),
            exhaustion_spills: AtomicU64::new(0),
            misuse_events: AtomicU64::new(0),
            torn_down: false,
        })
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// `Exhausted` or `OutOfMemory`, as for the single-threaded manager.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        let resolution = self.registry.resolve(size);
        self.allocate_resolved(size, 1, resolution, Location::caller())
    }

    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    #[track_caller]
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        let resolution = self.registry.resolve_aligned(layout.size(), layout.align());
        self.allocate_resolved(layout.size(), layout.align(), resolution, Location::caller())
    }

    fn allocate_resolved(
        &self,
        size: usize,
        align: usize,
        resolution: Resolution,
        site: &'static Location<'static>,
    ) -> Result<NonNull<u8>, MemError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);

        let ptr = match resolution {
            Resolution::UseFallback => {
                lock(&self.fallback).allocate(size, align, None, sequence, site)?
            }
            Resolution::Pool(id) => {
                let result = lock(&self.shards[id.index()]).allocate(size, align, sequence, site);
                match result {
                    Ok(ptr) => ptr,
                    Err(MemError::Exhausted { block_size })
                        if self.exhaustion_policy == ExhaustionPolicy::Fallback =>
                    {
                        self.exhaustion_spills.fetch_add(1, Ordering::Relaxed);
                        let mut fallback = lock(&self.fallback);
                        log::warn!(
                            "{block_size}-byte pool exhausted, spilling {size}-byte request to {} fallback",
                            fallback.name()
                        );
                        fallback.allocate(size, align, Some(block_size), sequence, site)?
                    }
                    Err(e) => {
                        log::debug!("allocation of {size} bytes failed: {e}");
                        return Err(e);
                    }
                }
            }
        };

        log::trace!("allocate({size}) -> {ptr:p} (seq {sequence}) at {site}");
        Ok(ptr)
    }

    /// Return an allocation. Only the owning pool's lock is taken.
    ///
    /// # Errors
    ///
    /// `DoubleFree` or `UnknownAddress`; under `MisusePolicy::Panic` these
    /// panic instead, after every lock has been released.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let addr = ptr.as_ptr() as usize;

        // Pool arenas and fallback blocks never overlap, so checking the
        // immutable ranges first gives the same answer without a lock.
        let result = match self.ranges.iter().position(|range| range.owns(addr)) {
            Some(index) => lock(&self.shards[index]).free(ptr).map(|record| {
                log::trace!("free({ptr:p}) -> {} (seq {})", record.origin, record.sequence);
            }),
            None => match lock(&self.fallback).free(ptr) {
                Some(record) => {
                    log::trace!("free({ptr:p}) -> fallback (seq {})", record.sequence);
                    Ok(())
                }
                None => Err(MemError::UnknownAddress { addr }),
            },
        };

        result.map_err(|err| {
            if err.is_misuse() {
                self.misuse_events.fetch_add(1, Ordering::Relaxed);
                report_misuse(self.misuse_policy, err)
            } else {
                err
            }
        })
    }

    /// Every live allocation, oldest first.
    ///
    /// Shards are locked one at a time, so under concurrent use this is a
    /// best-effort snapshot.
    #[must_use]
    pub fn outstanding_allocations(&self) -> Vec<AllocationRecord> {
        let mut records = Vec::new();
        for shard in &self.shards {
            records.extend(lock(shard).records().copied());
        }
        records.extend(lock(&self.fallback).records().copied());
        diagnostics::sorted(records)
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let (fallback_live, fallback_bytes) = {
            let fallback = lock(&self.fallback);
            (fallback.live(), fallback.live_bytes())
        };
        ManagerStats {
            pools: self.shards.iter().map(|shard| lock(shard).stats()).collect(),
            fallback_live,
            fallback_bytes,
            exhaustion_spills: self.exhaustion_spills.load(Ordering::Relaxed),
            misuse_events: self.misuse_events.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SizeClassRegistry {
        &self.registry
    }

    /// # Errors
    ///
    /// `Corrupted` naming the first inconsistent pool.
    pub fn check_integrity(&self) -> Result<(), MemError> {
        self.shards
            .iter()
            .try_for_each(|shard| lock(shard).check_integrity())
    }

    fn teardown_inner(&mut self) -> TeardownReport {
        self.torn_down = true;
        let mut leaks = Vec::new();
        let mut pools = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let mut shard = lock(shard);
            leaks.extend(shard.drain_records());
            pools.push(shard.stats());
        }
        leaks.extend(lock(&self.fallback).drain_and_release());
        TeardownReport {
            leaks: diagnostics::sorted(leaks),
            pools,
        }
    }

    /// # Panics
    ///
    /// Panics if leaks remain and the leak policy is `LeakPolicy::Panic`.
    pub fn teardown(mut self) -> TeardownReport {
        let report = self.teardown_inner();
        diagnostics::enforce_leak_policy(&report, self.leak_policy);
        report
    }
}

impl Drop for SharedMemoryManager {
    fn drop(&mut self) {
        if !self.torn_down {
            let report = self.teardown_inner();
            diagnostics::enforce_leak_policy(&report, LeakPolicy::Report);
        }
    }
}
