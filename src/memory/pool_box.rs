use super::error::MemError;
use super::manager::MemoryManager;
use super::shared::SharedMemoryManager;
use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Raw allocate/free pair that [`PoolBox`] builds on.
pub trait BlockAllocator {
    /// # Errors
    ///
    /// Whatever the underlying manager reports.
    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, MemError>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate_layout` on this allocator and nothing
    /// may use it afterwards.
    ///
    /// # Errors
    ///
    /// Misuse errors from the manager.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), MemError>;
}

impl BlockAllocator for SharedMemoryManager {
    #[track_caller]
    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        SharedMemoryManager::allocate_layout(self, layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), MemError> {
        SharedMemoryManager::free(self, ptr)
    }
}

/// Single-threaded managers are shared through a `RefCell`; the borrow only
/// lasts for the call itself.
impl BlockAllocator for RefCell<MemoryManager> {
    #[track_caller]
    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, MemError> {
        self.borrow_mut().allocate_layout(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), MemError> {
        self.borrow_mut().free(ptr)
    }
}

/// Owning pointer to a `T` stored in a manager slot.
///
/// Dropping the box runs `T`'s destructor and returns the slot, on every
/// exit path. Zero-sized types never touch a pool.
pub struct PoolBox<'a, T, A: BlockAllocator + ?Sized> {
    ptr: NonNull<T>,
    allocator: &'a A,
    _owns: PhantomData<T>,
}

// Safety: PoolBox owns its T exclusively; the allocator is only reached
// through a shared reference, so it must be Sync to cross threads.
unsafe impl<T: Send, A: BlockAllocator + Sync + ?Sized> Send for PoolBox<'_, T, A> {}
// Safety: &PoolBox only hands out &T.
unsafe impl<T: Sync, A: BlockAllocator + Sync + ?Sized> Sync for PoolBox<'_, T, A> {}

impl<'a, T, A: BlockAllocator + ?Sized> PoolBox<'a, T, A> {
    /// Move `value` into a slot sized and aligned for `T`.
    ///
    /// # Errors
    ///
    /// The allocation error; `value` is dropped in that case.
    #[track_caller]
    pub fn new_in(value: T, allocator: &'a A) -> Result<Self, MemError> {
        let layout = Layout::new::<T>();
        let ptr = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            allocator.allocate_layout(layout)?.cast::<T>()
        };
        // Safety: ptr is either dangling for a ZST or a fresh slot large and
        // aligned enough for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            allocator,
            _owns: PhantomData,
        })
    }

    /// Move the value back out and free the slot.
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        // Safety: the slot holds an initialised T that is read exactly once;
        // ManuallyDrop keeps Drop from touching it again.
        let value = unsafe { this.ptr.as_ptr().read() };
        this.release();
        value
    }

    /// Raw slot address. Null-free; dangling for zero-sized `T`.
    #[must_use]
    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }

    fn release(&self) {
        if size_of::<T>() == 0 {
            return;
        }
        // Safety: ptr came from allocate_layout on this allocator and the
        // value has already been dropped or moved out.
        if let Err(e) = unsafe { self.allocator.free(self.ptr.cast()) } {
            log::error!("PoolBox failed to free {:p}: {e}", self.ptr);
        }
    }
}

impl<T, A: BlockAllocator + ?Sized> Deref for PoolBox<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the slot holds an initialised T for the box's lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, A: BlockAllocator + ?Sized> DerefMut for PoolBox<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: &mut self gives exclusive access to the slot.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, A: BlockAllocator + ?Sized> Drop for PoolBox<'_, T, A> {
    fn drop(&mut self) {
        // Safety: the value is live and dropped exactly once.
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) };
        self.release();
    }
}

impl<T: fmt::Debug, A: BlockAllocator + ?Sized> fmt::Debug for PoolBox<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
