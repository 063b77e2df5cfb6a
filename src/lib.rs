//! Fixed-block memory pools with bitmap occupancy tracking.
//!
//! A [`MemoryManager`] owns one [`BlockPool`] per configured size class.
//! Requests are rounded up to the smallest class that fits, oversized
//! requests go to a [`FallbackAllocator`], and every live allocation is
//! recorded so teardown can report leaks with their call sites.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("blockmap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pools/managers
pub use memory::block_pool::BlockPool;
pub use memory::manager::MemoryManager;
pub use memory::pool_box::{BlockAllocator, PoolBox};
pub use memory::shared::SharedMemoryManager;

// configuration
pub use memory::config::{ExhaustionPolicy, LeakPolicy, ManagerConfig, MisusePolicy};
pub use memory::fallback::{FallbackAllocator, NoFallback, PageFallback, SystemFallback};
pub use memory::size_class::{PoolId, Resolution, SizeClassConfig, SizeClassRegistry};

// diagnostics/stats
pub use memory::diagnostics::{AllocationRecord, Origin, TeardownReport};
pub use memory::stats::{GlobalGauges, ManagerStats, PoolStats, global_gauges};

// errors
pub use memory::error::MemError;
pub use memory::vm::VmError;
