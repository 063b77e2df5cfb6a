// Synchronization primitive shim.
//
// Under `cfg(loom)` everything re-exports from `loom` so the model checker
// sees every lock and atomic the shared manager touches. Otherwise the same
// names resolve to `std`.
//
// Code in this crate imports locks and atomics through this module only. A
// direct `use std::sync::Mutex` in the shared manager would hide that lock
// from loom's scheduler.
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
}

#[cfg(loom)]
pub(crate) use loom::sync::{Mutex, MutexGuard};

#[cfg(not(loom))]
pub(crate) use std::sync::{Mutex, MutexGuard};

// Test-only: shared handles, threads and the TEST_MUTEX lock.
#[cfg(all(test, loom))]
pub(crate) use loom::sync::{Arc, RwLock};

#[cfg(all(test, not(loom)))]
pub(crate) use std::sync::{Arc, RwLock};


/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Pool state is only mutated after every fallible step has succeeded, so a
/// panic while holding the lock (strict misuse mode) leaves the bitmap
/// consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// loom has no OnceLock. The only user is the cached OS page size on the
// mmap-backed VM layer; the heap-backed mock returns a constant.
#[cfg(all(unix, not(any(loom, miri))))]
pub(crate) use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics and locks are not const-constructible. These macros declare
// statics that work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic. Under std this is a plain `const` init; under
/// loom it goes through `loom::lazy_static!` so every model run starts fresh.
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// Declare a `static` `RwLock`, loom-aware in the same way as
/// [`static_atomic!`].
#[cfg(test)]
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
#[cfg(test)]
pub(crate) use static_rwlock;
