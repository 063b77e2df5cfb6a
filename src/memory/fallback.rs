use super::error::MemError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use std::alloc::Layout;
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

/// Backing allocator for requests no size class can serve.
///
/// The manager only ever hands back pointers this allocator produced, with
/// the exact layout they were requested with.
pub trait FallbackAllocator {
    /// Short label used in logs and leak reports.
    fn name(&self) -> &'static str;

    /// Allocate memory for `layout` (never zero-sized).
    ///
    /// # Errors
    ///
    /// `OutOfMemory` (or `Vm` for page-backed allocators) on failure.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError>;

    /// Release memory obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this allocator with
    ///   the same `layout`.
    /// - `ptr` must not have been freed already.
    unsafe fn free(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Fallback through the process's global allocator.
#[derive(Debug, Default)]
pub struct SystemFallback {
    live_bytes: usize,
}

impl SystemFallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }
}

impl FallbackAllocator for SystemFallback {
    fn name(&self) -> &'static str {
        "system"
    }

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        debug_assert!(layout.size() > 0, "fallback asked for a zero-sized block");
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(MemError::OutOfMemory {
            size: layout.size(),
        })?;
        self.live_bytes += layout.size();
        stats::FALLBACK_BYTES.add(layout.size());
        Ok(ptr)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: caller guarantees ptr came from `allocate` with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.live_bytes = self.live_bytes.saturating_sub(layout.size());
        stats::FALLBACK_BYTES.sub(layout.size());
    }
}

/// Fallback that always fails. Use it to make oversized requests an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFallback;

impl FallbackAllocator for NoFallback {
    fn name(&self) -> &'static str {
        "none"
    }

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        Err(MemError::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        debug_assert!(false, "NoFallback never allocates, yet {ptr:p} was freed");
    }
}

/// Page-granular fallback backed by VM reservations.
///
/// Freed regions are decommitted and kept in a best-fit cache (keyed by
/// mapped size) up to `cache_limit` bytes, so repeated large requests avoid
/// new reservations. Alignment above the page size is not supported.
pub struct PageFallback {
    /// Decommitted regions by mapped size.
    cached: BTreeMap<usize, Vec<NonNull<u8>>>,
    cached_bytes: usize,
    cache_limit: usize,
    /// Live region start -> mapped size. Best-fit reuse can hand out a
    /// region larger than requested.
    live: HashMap<usize, usize>,
}

// Safety: PageFallback owns every region it tracks.
unsafe impl Send for PageFallback {}

impl PageFallback {
    #[must_use]
    pub fn new(cache_limit: usize) -> Self {
        Self {
            cached: BTreeMap::new(),
            cached_bytes: 0,
            cache_limit,
            live: HashMap::new(),
        }
    }

    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.live.len()
    }

    fn take_cached(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        let (&mapped, list) = self.cached.range_mut(size..).next()?;
        let ptr = list.pop()?;
        if list.is_empty() {
            self.cached.remove(&mapped);
        }
        self.cached_bytes -= mapped;
        Some((ptr, mapped))
    }

    fn release_region(ptr: NonNull<u8>, mapped: usize) {
        // Safety: ptr..ptr+mapped is a reservation this fallback made.
        if let Err(e) = unsafe { PlatformVmOps::release(ptr, mapped) } {
            log::error!("page fallback failed to release {mapped} bytes at {ptr:p}: {e}");
        }
        stats::TOTAL_RESERVED.sub(mapped);
    }

    /// Release every cached region back to the OS.
    pub fn trim(&mut self) {
        for (mapped, list) in std::mem::take(&mut self.cached) {
            for ptr in list {
                Self::release_region(ptr, mapped);
            }
        }
        self.cached_bytes = 0;
    }
}

impl FallbackAllocator for PageFallback {
    fn name(&self) -> &'static str {
        "page"
    }

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        let page = PlatformVmOps::page_size();
        if layout.align() > page {
            log::warn!(
                "page fallback cannot honour alignment {} (page size {page})",
                layout.align()
            );
            return Err(MemError::OutOfMemory {
                size: layout.size(),
            });
        }
        let size = layout
            .size()
            .checked_next_multiple_of(page)
            .ok_or(MemError::OutOfMemory {
                size: layout.size(),
            })?;

        let (ptr, mapped) = if let Some((ptr, mapped)) = self.take_cached(size) {
            // Safety: cached regions are decommitted parts of our reservations.
            if let Err(e) = unsafe { PlatformVmOps::commit(ptr, mapped) } {
                Self::release_region(ptr, mapped);
                return Err(e.into());
            }
            (ptr, mapped)
        } else {
            // Safety: size is a non-zero multiple of the page size.
            let ptr = unsafe { PlatformVmOps::reserve_committed(size)? };
            stats::TOTAL_RESERVED.add(size);
            (ptr, size)
        };

        stats::TOTAL_COMMITTED.add(mapped);
        stats::FALLBACK_BYTES.add(mapped);
        self.live.insert(ptr.as_ptr() as usize, mapped);
        Ok(ptr)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        let Some(mapped) = self.live.remove(&(ptr.as_ptr() as usize)) else {
            log::warn!("page fallback asked to free untracked region {ptr:p}");
            return;
        };
        stats::TOTAL_COMMITTED.sub(mapped);
        stats::FALLBACK_BYTES.sub(mapped);

        let fits = self
            .cached_bytes
            .checked_add(mapped)
            .is_some_and(|next| next <= self.cache_limit);
        // Safety: the region is live in our map, so it is committed and ours.
        if fits && unsafe { PlatformVmOps::decommit(ptr, mapped) }.is_ok() {
            self.cached.entry(mapped).or_default().push(ptr);
            self.cached_bytes += mapped;
        } else {
            Self::release_region(ptr, mapped);
        }
    }
}

impl Drop for PageFallback {
    fn drop(&mut self) {
        self.trim();
        for (addr, mapped) in std::mem::take(&mut self.live) {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                stats::TOTAL_COMMITTED.sub(mapped);
                stats::FALLBACK_BYTES.sub(mapped);
                Self::release_region(ptr, mapped);
            }
        }
    }
}
