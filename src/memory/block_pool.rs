use super::error::MemError;
use super::slot_map::SlotBitmap;
use super::stats::{self, PoolStats};
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// Byte written over freed payloads when poisoning is enabled.
pub(crate) const POISON_BYTE: u8 = 0xDD;

/// A fixed arena of `block_count` slots of `block_size` bytes each.
///
/// The arena is a single committed VM reservation owned by the pool. Slot `i`
/// lives at `base + i * block_size`; the bitmap records which slots are
/// occupied. The pool never grows and never touches payload bytes (unless
/// poisoning is enabled in a debug build).
pub struct BlockPool {
    base: NonNull<u8>,
    block_size: usize,
    block_count: usize,
    /// Reservation size, `block_size * block_count` rounded up to a page.
    arena_bytes: usize,
    slots: SlotBitmap,
    high_water: usize,
    allocations: u64,
    frees: u64,
    poison_freed: bool,
}

// Safety: the pool exclusively owns its arena; the raw base pointer is never
// shared outside of slot addresses handed to the caller.
unsafe impl Send for BlockPool {}

impl BlockPool {
    /// Reserve and commit an arena for `block_count` slots of `block_size`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when either dimension is zero or the arena size
    /// overflows, `Vm` when the reservation fails.
    pub(crate) fn new(block_size: usize, block_count: usize) -> Result<Self, MemError> {
        if block_size == 0 || block_count == 0 {
            return Err(MemError::InvalidConfig(format!(
                "pool dimensions must be non-zero (block_size={block_size}, block_count={block_count})"
            )));
        }
        let arena_bytes = block_size
            .checked_mul(block_count)
            .and_then(|bytes| bytes.checked_next_multiple_of(PlatformVmOps::page_size()))
            .ok_or_else(|| {
                MemError::InvalidConfig(format!(
                    "arena size overflows (block_size={block_size}, block_count={block_count})"
                ))
            })?;

        // Safety: arena_bytes is a non-zero multiple of the page size.
        let base = unsafe { PlatformVmOps::reserve_committed(arena_bytes)? };

        stats::TOTAL_RESERVED.add(arena_bytes);
        stats::TOTAL_COMMITTED.add(arena_bytes);
        stats::POOL_ARENA_BYTES.add(arena_bytes);
        log::debug!(
            "reserved {arena_bytes} byte arena at {base:p} for {block_count} x {block_size} byte blocks"
        );

        Ok(Self {
            base,
            block_size,
            block_count,
            arena_bytes,
            slots: SlotBitmap::new(block_count),
            high_water: 0,
            allocations: 0,
            frees: 0,
            poison_freed: false,
        })
    }

    pub(crate) fn with_poisoning(mut self, enabled: bool) -> Self {
        self.poison_freed = enabled;
        self
    }

    /// Claim the lowest free slot.
    ///
    /// # Errors
    ///
    /// `Exhausted` when every slot is occupied.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, MemError> {
        let index = self.slots.claim_first_free().ok_or(MemError::Exhausted {
            block_size: self.block_size,
        })?;

        self.allocations += 1;
        self.high_water = self.high_water.max(self.block_count - self.slots.free_count());
        stats::POOL_LIVE_SLOTS.add(1);
        Ok(self.slot_ptr(index))
    }

    /// Return the slot at `ptr` to the pool.
    ///
    /// Only bookkeeping changes; the caller is responsible for whatever
    /// object lived in the slot.
    ///
    /// # Errors
    ///
    /// `InvalidAddress` if `ptr` is not a slot of this pool, `DoubleFree` if
    /// the slot is already free.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemError> {
        let index = self.slot_index(ptr.as_ptr() as usize)?;
        if !self.slots.release(index) {
            return Err(MemError::DoubleFree {
                addr: ptr.as_ptr() as usize,
                block_size: self.block_size,
            });
        }

        if cfg!(debug_assertions) && self.poison_freed {
            // Safety: the slot is inside our committed arena and now free.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), POISON_BYTE, self.block_size) };
        }

        self.frees += 1;
        stats::POOL_LIVE_SLOTS.sub(1);
        Ok(())
    }

    /// Range and slot-boundary containment. Pure; says nothing about whether
    /// the slot is currently occupied.
    #[must_use]
    pub fn owns_address(&self, addr: usize) -> bool {
        self.slot_index(addr).is_ok()
    }

    /// True when `addr` is a slot of this pool that is currently occupied.
    #[must_use]
    pub fn is_live(&self, addr: usize) -> bool {
        self.slot_index(addr)
            .is_ok_and(|index| self.slots.is_occupied(index))
    }

    // Address <-> index translation. All slot arithmetic goes through these two.

    fn slot_index(&self, addr: usize) -> Result<usize, MemError> {
        let base = self.base_addr();
        let offset = addr
            .checked_sub(base)
            .ok_or(MemError::InvalidAddress { addr })?;
        if offset >= self.block_size * self.block_count || !offset.is_multiple_of(self.block_size) {
            return Err(MemError::InvalidAddress { addr });
        }
        Ok(offset / self.block_size)
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.slots.len(), "slot {index} out of range");
        // Safety: index < block_count, so the offset stays inside the arena.
        unsafe { self.base.add(index * self.block_size) }
    }

    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last slot byte.
    #[must_use]
    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.block_size * self.block_count
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.slots.free_count()
    }

    /// Alignment every slot address is guaranteed to have.
    #[must_use]
    pub fn slot_align(&self) -> usize {
        slot_align_for(self.block_size)
    }

    /// Addresses of occupied slots, ascending.
    pub fn occupied_addresses(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.slots
            .occupied_indices()
            .map(|index| self.slot_ptr(index))
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.block_size,
            block_count: self.block_count,
            free_count: self.free_count(),
            high_water: self.high_water,
            allocations: self.allocations,
            frees: self.frees,
            reserved: true,
        }
    }

    /// Recount the bitmap and compare with the cached free count.
    ///
    /// # Errors
    ///
    /// `Corrupted` describing the mismatch.
    pub fn check_integrity(&self) -> Result<(), MemError> {
        let recounted = self.slots.recount_free();
        if recounted != self.slots.free_count() {
            return Err(MemError::Corrupted(format!(
                "{}-byte pool caches free_count={} but bitmap has {} clear bits",
                self.block_size,
                self.slots.free_count(),
                recounted
            )));
        }
        let live = (self.allocations - self.frees) as usize;
        if live != self.block_count - recounted {
            return Err(MemError::Corrupted(format!(
                "{}-byte pool counted {} live allocations but bitmap has {} set bits",
                self.block_size,
                live,
                self.block_count - recounted
            )));
        }
        Ok(())
    }
}

/// Guaranteed alignment of `base + i * block_size` for a page-aligned base.
pub(crate) fn slot_align_for(block_size: usize) -> usize {
    let natural = 1usize << block_size.trailing_zeros();
    natural.min(PlatformVmOps::page_size())
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let live = self.block_count - self.slots.free_count();
        // Safety: we own the reservation and nothing can reach it after drop.
        if let Err(e) = unsafe { PlatformVmOps::release(self.base, self.arena_bytes) } {
            log::error!(
                "failed to release {}-byte pool arena at {:p}: {e}",
                self.block_size,
                self.base
            );
        }
        stats::TOTAL_RESERVED.sub(self.arena_bytes);
        stats::TOTAL_COMMITTED.sub(self.arena_bytes);
        stats::POOL_ARENA_BYTES.sub(self.arena_bytes);
        if live > 0 {
            stats::POOL_LIVE_SLOTS.sub(live);
        }
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("base", &self.base)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("free_count", &self.free_count())
            .finish_non_exhaustive()
    }
}
