//! The contract every allocator in this crate implements.
//!
//! [`Allocator`] is the minimal surface consumed by callers (and by nested
//! allocators, which source their arena from a parent through it).
//! [`ArenaAllocator`] adds fit-mode control and layout introspection for the
//! fixed-capacity strategies.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::blocks::{self, BlockInfo, Coalescing, Stats, Validity};
use crate::error::Result;
use crate::fit::FitMode;

/// Carves regions out of some backing store and takes them back.
///
/// Implementations synchronise internally, so every method takes `&self` and
/// an allocator can be shared behind an `Arc`.
pub trait Allocator: Send + Sync {
    /// Allocate room for `values_count` values of `value_size` bytes each.
    ///
    /// On success the returned pointer is never null and is aligned to at
    /// least a machine word. Fails with [`Error::OutOfMemory`] when no free
    /// block can hold the request.
    ///
    /// [`Error::OutOfMemory`]: crate::Error::OutOfMemory
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>>;

    /// Give back a region previously returned by [`allocate`] on this same
    /// instance.
    ///
    /// Deallocating a null pointer does nothing. Anything else that this
    /// instance did not issue, or already took back, is rejected with
    /// [`Error::ForeignPointer`].
    ///
    /// [`allocate`]: Allocator::allocate
    /// [`Error::ForeignPointer`]: crate::Error::ForeignPointer
    fn deallocate(&self, at: *mut u8) -> Result<()>;
}

/// A fixed-capacity allocator managing a single arena.
pub trait ArenaAllocator: Allocator {
    /// Change how future allocations choose among fitting blocks.
    fn set_fit_mode(&self, mode: FitMode);

    fn fit_mode(&self) -> FitMode;

    /// The arena's blocks, left to right, covering its whole data region.
    fn blocks_info(&self) -> Vec<BlockInfo>;

    /// Bytes not held by occupied blocks (headers included).
    fn available_size(&self) -> usize;

    /// Capacity of the arena's data region.
    fn total_size(&self) -> usize;

    /// The merge rule this strategy maintains.
    fn coalescing(&self) -> Coalescing {
        Coalescing::Adjacent
    }

    /// Check the current layout against this strategy's coalescing rule.
    fn stats(&self) -> (Validity, Stats) {
        blocks::check(&self.blocks_info(), self.coalescing())
    }
}

/// Move `value` into allocator-owned storage at `at`.
///
/// # Safety
///
/// `at` must point to a live region of at least `size_of::<T>()` bytes,
/// suitably aligned for `T`, that holds no other live value.
pub unsafe fn construct<T>(at: NonNull<u8>, value: T) -> NonNull<T> {
    let typed = at.cast::<T>();
    debug_assert_eq!(typed.as_ptr() as usize % core::mem::align_of::<T>(), 0);
    typed.as_ptr().write(value);
    typed
}

/// Run the destructor of the value at `at`, leaving the storage allocated.
///
/// # Safety
///
/// `at` must point to a value previously placed with [`construct`] (or
/// otherwise initialised) that has not been destructed yet.
pub unsafe fn destruct<T>(at: NonNull<T>) {
    core::ptr::drop_in_place(at.as_ptr());
}
