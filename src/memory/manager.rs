use super::block_pool::BlockPool;
use super::config::{ExhaustionPolicy, LeakPolicy, ManagerConfig, MisusePolicy};
use super::diagnostics::{self, AllocationRecord, LeakTracker, Origin, TeardownReport};
use super::error::MemError;
use super::fallback::{FallbackAllocator, SystemFallback};
use super::size_class::{PoolId, Resolution, SizeClassConfig, SizeClassRegistry};
use super::stats::{ManagerStats, PoolStats};
use std::alloc::Layout;
use std::panic::Location;
use std::ptr::NonNull;

/// Layout used for fallback requests. Zero-sized requests get one byte so the
/// fallback never sees a zero-sized layout.
pub(crate) fn fallback_layout(size: usize, align: usize) -> Result<Layout, MemError> {
    Layout::from_size_align(size.max(1), align.max(1)).map_err(|_| MemError::OutOfMemory { size })
}

/// A pool plus the tracker entries for the slots it has handed out.
///
/// The shared manager wraps one of these per lock, so a pool's bitmap and
/// its diagnostics always change together.
pub(crate) struct PoolShard {
    id: PoolId,
    class: SizeClassConfig,
    pool: Option<BlockPool>,
    tracker: LeakTracker,
    poison_freed: bool,
}

impl PoolShard {
    pub fn new(id: PoolId, class: SizeClassConfig, eager: bool, poison_freed: bool) -> Result<Self, MemError> {
        let mut shard = Self {
            id,
            class,
            pool: None,
            tracker: LeakTracker::new(),
            poison_freed,
        };
        if eager {
            shard.ensure_pool()?;
        }
        Ok(shard)
    }

    fn ensure_pool(&mut self) -> Result<&mut BlockPool, MemError> {
        if self.pool.is_none() {
            let pool = BlockPool::new(self.class.block_size, self.class.block_count)?
                .with_poisoning(self.poison_freed);
            log::debug!("created pool #{} ({:?})", self.id.index(), pool);
            self.pool = Some(pool);
        }
        self.pool.as_mut().ok_or_else(|| {
            MemError::Corrupted(format!("pool #{} missing after creation", self.id.index()))
        })
    }

    pub fn pool(&self) -> Option<&BlockPool> {
        self.pool.as_ref()
    }

    pub fn owns_address(&self, addr: usize) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.owns_address(addr))
    }

    /// Address range `[start, end)` of the arena, if it exists.
    pub fn range(&self) -> Option<(usize, usize)> {
        self.pool.as_ref().map(|pool| (pool.base_addr(), pool.end_addr()))
    }

    pub fn allocate(
        &mut self,
        size: usize,
        align: usize,
        sequence: u64,
        site: &'static Location<'static>,
    ) -> Result<NonNull<u8>, MemError> {
        let id = self.id;
        let pool = self.ensure_pool()?;
        let ptr = pool.allocate()?;
        let block_size = pool.block_size();
        self.tracker.insert(AllocationRecord {
            address: ptr.as_ptr() as usize,
            size,
            align,
            origin: Origin::Pool { id, block_size },
            sequence,
            site,
        });
        Ok(ptr)
    }

    /// Free a slot this shard owns. The caller checked `owns_address`.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<AllocationRecord, MemError> {
        let addr = ptr.as_ptr() as usize;
        let pool = self
            .pool
            .as_mut()
            .ok_or(MemError::UnknownAddress { addr })?;
        pool.free(ptr)?;
        self.tracker.remove(addr).ok_or_else(|| {
            MemError::Corrupted(format!(
                "slot {addr:#x} was occupied in the bitmap but had no allocation record"
            ))
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.tracker.records()
    }

    pub fn drain_records(&mut self) -> Vec<AllocationRecord> {
        self.tracker.drain_sorted()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.as_ref().map_or(
            PoolStats {
                block_size: self.class.block_size,
                block_count: self.class.block_count,
                free_count: self.class.block_count,
                reserved: false,
                ..PoolStats::default()
            },
            BlockPool::stats,
        )
    }

    pub fn check_integrity(&self) -> Result<(), MemError> {
        let Some(pool) = &self.pool else {
            if self.tracker.len() != 0 {
                return Err(MemError::Corrupted(format!(
                    "pool #{} has records but no arena",
                    self.id.index()
                )));
            }
            return Ok(());
        };
        pool.check_integrity()?;
        let occupied = pool.block_count() - pool.free_count();
        if occupied != self.tracker.len() {
            return Err(MemError::Corrupted(format!(
                "{}-byte pool has {occupied} occupied slots but {} records",
                pool.block_size(),
                self.tracker.len()
            )));
        }
        if let Some(stray) = self.tracker.records().find(|r| !pool.is_live(r.address)) {
            return Err(MemError::Corrupted(format!(
                "record {stray} points at a slot the bitmap marks free"
            )));
        }
        Ok(())
    }
}

/// The fallback allocator plus the records of what it currently holds.
pub(crate) struct FallbackShard<F: ?Sized> {
    tracker: LeakTracker,
    live_bytes: usize,
    allocator: Box<F>,
}

impl<F: FallbackAllocator + ?Sized> FallbackShard<F> {
    pub fn new(allocator: Box<F>) -> Self {
        Self {
            tracker: LeakTracker::new(),
            live_bytes: 0,
            allocator,
        }
    }

    pub fn name(&self) -> &'static str {
        self.allocator.name()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.tracker.get(addr).is_some()
    }

    pub fn allocate(
        &mut self,
        size: usize,
        align: usize,
        exhausted_class: Option<usize>,
        sequence: u64,
        site: &'static Location<'static>,
    ) -> Result<NonNull<u8>, MemError> {
        let layout = fallback_layout(size, align)?;
        let ptr = self.allocator.allocate(layout).map_err(|e| match e {
            MemError::Vm(vm) => {
                log::warn!("{} fallback failed for {size} bytes: {vm}", self.allocator.name());
                MemError::OutOfMemory { size }
            }
            other => other,
        })?;
        self.live_bytes += layout.size();
        self.tracker.insert(AllocationRecord {
            address: ptr.as_ptr() as usize,
            size,
            align: layout.align(),
            origin: Origin::Fallback { exhausted_class },
            sequence,
            site,
        });
        Ok(ptr)
    }

    /// Free a fallback block if this shard issued it.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Option<AllocationRecord> {
        let record = self.tracker.remove(ptr.as_ptr() as usize)?;
        self.release(ptr, &record);
        Some(record)
    }

    fn release(&mut self, ptr: NonNull<u8>, record: &AllocationRecord) {
        match fallback_layout(record.size, record.align) {
            Ok(layout) => {
                // Safety: the record proves ptr came from this allocator with
                // this layout, and removing it guarantees a single free.
                unsafe { self.allocator.free(ptr, layout) };
                self.live_bytes = self.live_bytes.saturating_sub(layout.size());
            }
            Err(e) => log::error!("cannot rebuild layout for {record}: {e}"),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.tracker.records()
    }

    pub fn live(&self) -> usize {
        self.tracker.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Report and release every outstanding fallback block.
    pub fn drain_and_release(&mut self) -> Vec<AllocationRecord> {
        let leaks = self.tracker.drain_sorted();
        for record in &leaks {
            if let Some(ptr) = NonNull::new(record.address as *mut u8) {
                self.release(ptr, record);
            }
        }
        leaks
    }
}

/// Escalate or report caller misuse according to policy.
pub(crate) fn report_misuse(policy: MisusePolicy, err: MemError) -> MemError {
    log::warn!("allocator misuse: {err}");
    if policy == MisusePolicy::Panic {
        panic!("allocator misuse: {err}");
    }
    err
}

/// Single-threaded façade over a fixed set of block pools.
///
/// Requests are rounded up to the smallest configured size class; anything
/// larger than every class goes to the fallback allocator. Every live
/// allocation is recorded so [`teardown`](Self::teardown) can list leaks.
///
/// ```
/// use blockmap::{ManagerConfig, MemoryManager, SizeClassConfig};
///
/// let config = ManagerConfig::default().with_size_classes([
///     SizeClassConfig::new(16, 64),
///     SizeClassConfig::new(64, 64),
/// ]);
/// let mut manager = MemoryManager::new(config).unwrap();
/// let ptr = manager.allocate(50).unwrap();
/// manager.free(ptr).unwrap();
/// assert!(manager.teardown().is_clean());
/// ```
pub struct MemoryManager {
    registry: SizeClassRegistry,
    shards: Vec<PoolShard>,
    fallback: FallbackShard<dyn FallbackAllocator>,
    exhaustion_policy: ExhaustionPolicy,
    misuse_policy: MisusePolicy,
    leak_policy: LeakPolicy,
    next_sequence: u64,
    exhaustion_spills: u64,
    misuse_events: u64,
    torn_down: bool,
}

impl MemoryManager {
    /// Build a manager whose fallback is the global allocator.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad size-class list, `Vm` if an arena cannot be
    /// reserved.
    pub fn new(config: ManagerConfig) -> Result<Self, MemError> {
        Self::with_fallback(config, SystemFallback::new())
    }

    /// Build a manager with a custom fallback allocator.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_fallback(
        config: ManagerConfig,
        fallback: impl FallbackAllocator + 'static,
    ) -> Result<Self, MemError> {
        let registry = SizeClassRegistry::new(&config.size_classes)?;
        let shards = registry
            .ids()
            .map(|id| PoolShard::new(id, registry.class(id), !config.lazy_pools, config.poison_freed))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "memory manager up: {} size class(es) up to {} bytes, {} fallback, lazy={}",
            registry.len(),
            registry.largest_block_size(),
            fallback.name(),
            config.lazy_pools
        );

        let fallback: Box<dyn FallbackAllocator> = Box::new(fallback);
        Ok(Self {
            registry,
            shards,
            fallback: FallbackShard::new(fallback),
            exhaustion_policy: config.exhaustion_policy,
            misuse_policy: config.misuse_policy,
            leak_policy: config.leak_policy,
            next_sequence: 0,
            exhaustion_spills: 0,
            misuse_events: 0,
            torn_down: false,
        })
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    ///
    /// `Exhausted` if the class's pool is full and the exhaustion policy is
    /// `Fail`; `OutOfMemory` if the fallback cannot serve the request.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        let resolution = self.registry.resolve(size);
        self.allocate_resolved(size, 1, resolution, Location::caller())
    }

    /// Allocate memory satisfying both size and alignment of `layout`.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    #[track_caller]
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        let resolution = self.registry.resolve_aligned(layout.size(), layout.align());
        self.allocate_resolved(layout.size(), layout.align(), resolution, Location::caller())
    }

    fn allocate_resolved(
        &mut self,
        size: usize,
        align: usize,
        resolution: Resolution,
        site: &'static Location<'static>,
    ) -> Result<NonNull<u8>, MemError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let ptr = match resolution {
            Resolution::UseFallback => self.fallback.allocate(size, align, None, sequence, site)?,
            Resolution::Pool(id) => match self.shards[id.index()].allocate(size, align, sequence, site) {
                Ok(ptr) => ptr,
                Err(MemError::Exhausted { block_size })
                    if self.exhaustion_policy == ExhaustionPolicy::Fallback =>
                {
                    self.exhaustion_spills += 1;
                    log::warn!(
                        "{block_size}-byte pool exhausted, spilling {size}-byte request to {} fallback",
                        self.fallback.name()
                    );
                    self.fallback
                        .allocate(size, align, Some(block_size), sequence, site)?
                }
                Err(e) => {
                    log::debug!("allocation of {size} bytes failed: {e}");
                    return Err(e);
                }
            },
        };

        log::trace!("allocate({size}) -> {ptr:p} (seq {sequence}) at {site}");
        Ok(ptr)
    }

    /// Return an allocation. The owning pool (or the fallback) is found from
    /// the address alone.
    ///
    /// # Errors
    ///
    /// `DoubleFree` if the slot is already free, `UnknownAddress` if nothing
    /// here issued `ptr`. Under `MisusePolicy::Panic` these panic instead.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let addr = ptr.as_ptr() as usize;

        if let Some(record) = self.fallback.free(ptr) {
            log::trace!("free({ptr:p}) -> {} fallback (seq {})", self.fallback.name(), record.sequence);
            return Ok(());
        }

        let result = match self.shards.iter_mut().find(|shard| shard.owns_address(addr)) {
            Some(shard) => shard.free(ptr).map(|record| {
                log::trace!("free({ptr:p}) -> {} (seq {})", record.origin, record.sequence);
            }),
            None => Err(MemError::UnknownAddress { addr }),
        };

        result.map_err(|err| {
            if err.is_misuse() {
                self.misuse_events += 1;
                report_misuse(self.misuse_policy, err)
            } else {
                err
            }
        })
    }

    /// True when `ptr` is a live allocation of this manager.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.fallback.contains(addr)
            || self
                .shards
                .iter()
                .filter_map(PoolShard::pool)
                .any(|pool| pool.is_live(addr))
    }

    /// Every live allocation, oldest first. Read-only.
    #[must_use]
    pub fn outstanding_allocations(&self) -> Vec<AllocationRecord> {
        diagnostics::sorted(
            self.shards
                .iter()
                .flat_map(PoolShard::records)
                .chain(self.fallback.records())
                .copied()
                .collect(),
        )
    }

    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            pools: self.shards.iter().map(PoolShard::stats).collect(),
            fallback_live: self.fallback.live(),
            fallback_bytes: self.fallback.live_bytes(),
            exhaustion_spills: self.exhaustion_spills,
            misuse_events: self.misuse_events,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SizeClassRegistry {
        &self.registry
    }

    /// The pool for `id`, or `None` while a lazy pool is still unreserved.
    #[must_use]
    pub fn pool(&self, id: PoolId) -> Option<&BlockPool> {
        self.shards.get(id.index()).and_then(PoolShard::pool)
    }

    /// Cross-check every pool's bitmap against its cached counters and the
    /// allocation records.
    ///
    /// # Errors
    ///
    /// `Corrupted` naming the first inconsistency.
    pub fn check_integrity(&self) -> Result<(), MemError> {
        self.shards.iter().try_for_each(PoolShard::check_integrity)
    }

    fn teardown_inner(&mut self) -> TeardownReport {
        self.torn_down = true;
        let mut leaks: Vec<_> = self
            .shards
            .iter_mut()
            .flat_map(PoolShard::drain_records)
            .collect();
        leaks.extend(self.fallback.drain_and_release());
        TeardownReport {
            leaks: diagnostics::sorted(leaks),
            pools: self.shards.iter().map(PoolShard::stats).collect(),
        }
    }

    /// Tear the manager down: report leaks, release leaked fallback blocks
    /// and every arena.
    ///
    /// # Panics
    ///
    /// Panics if leaks remain and the leak policy is `LeakPolicy::Panic`.
    pub fn teardown(mut self) -> TeardownReport {
        let report = self.teardown_inner();
        diagnostics::enforce_leak_policy(&report, self.leak_policy);
        report
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.torn_down {
            let report = self.teardown_inner();
            // Never panic from drop; the leaks are still logged.
            diagnostics::enforce_leak_policy(&report, LeakPolicy::Report);
        }
    }
}
