//! The allocator interface seen by value-layer code
//!
//! Vectors, tables and string pools allocate through this trait so
//! that alternative allocators can stand behind them.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use super::error::{trap, MemoryError};

/// Emitted for every successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent {
    /// Allocation count for this allocator, starting at 1
    pub serial: u64,
    /// Requested size in bytes
    pub size: usize,
    pub ptr: NonNull<u8>,
}

/// Callback observing allocations, e.g. to break on the Nth
pub type AllocationHook = Box<dyn FnMut(&AllocationEvent)>;

/// Allocator for runtime values
///
/// Contract violations (foreign pointers, size mismatches, operations
/// out of cycle order) trap rather than returning errors.
pub trait Allocator {
    /// Allocate `size` bytes; `None` only for a zero size
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Free memory returned by `allocate` with the same `size`
    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);

    /// Begin a mark cycle
    fn prepare_for_gc(&mut self);

    /// Mark the object at `ptr` reachable; returns whether the mark is new
    fn mark(&mut self, ptr: NonNull<u8>, size: usize) -> bool;

    /// Reclaim everything left unmarked and end the cycle
    fn sweep(&mut self);

    /// Release every allocation outright
    fn reset(&mut self);

    /// Allocate space for `value` and move it in
    fn allocate_typed<T>(&mut self, value: T) -> NonNull<T>
    where
        Self: Sized,
    {
        let size = size_of::<T>();
        if size == 0 {
            std::mem::forget(value);
            return NonNull::dangling();
        }

        let ptr = match self.allocate(size) {
            Some(ptr) => ptr.cast::<T>(),
            None => trap(MemoryError::OutOfMemory { requested: size }),
        };
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            self.deallocate(ptr.cast(), size);
            trap(MemoryError::BadRequest(format!(
                "{} requires alignment {}",
                std::any::type_name::<T>(),
                align_of::<T>()
            )));
        }
        // SAFETY: freshly allocated, suitably sized and aligned
        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Drop the value at `ptr` and free its memory
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate_typed` on this allocator
    /// and must not be used afterwards.
    unsafe fn destroy_typed<T>(&mut self, ptr: NonNull<T>)
    where
        Self: Sized,
    {
        std::ptr::drop_in_place(ptr.as_ptr());
        let size = size_of::<T>();
        if size != 0 {
            self.deallocate(ptr.cast(), size);
        }
    }
}
