//! Blocks of memory acquired from the system allocator
//!
//! Heavily based on https://rust-hosted-langs.github.io/ but slabs
//! and stacks need arbitrary sizes rather than power of two blocks.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// A block of memory allocated by the upstream allocator
#[derive(Debug, PartialEq)]
pub struct Block {
    /// Pointer to memory
    ptr: NonNull<u8>,
    /// Size of block
    size: usize,
    /// Alignment the block was requested with
    align: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    BadSize { size: usize, align: usize },
    OOM { size: usize },
}

impl Block {
    pub fn new(size: usize, align: usize) -> Result<Self, BlockError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(BlockError::BadSize { size, align });
        }
        let layout =
            Layout::from_size_align(size, align).map_err(|_| BlockError::BadSize { size, align })?;
        Ok(Block {
            ptr: Self::alloc_block(layout)?,
            size,
            align,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address one past the end of the block
    pub fn end(&self) -> usize {
        self.ptr.as_ptr() as usize + self.size
    }

    /// Byte offset of `ptr` within the block, if it lies inside
    pub fn byte_offset_of<T>(&self, ptr: NonNull<T>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let base = self.ptr.as_ptr() as usize;
        if addr >= base && addr < self.end() {
            Some(addr - base)
        } else {
            None
        }
    }

    /// Overwrite `len` bytes from `offset` with `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.size);
        // SAFETY: range checked against the block size above and the
        // block exclusively owns its memory
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len);
        }
    }

    /// View `len` bytes from `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size);
        // SAFETY: as for fill
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Blocks are zeroed so `bytes` never exposes uninitialised memory
    fn alloc_block(layout: Layout) -> Result<NonNull<u8>, BlockError> {
        unsafe {
            let ptr = alloc_zeroed(layout);
            NonNull::new(ptr).ok_or(BlockError::OOM {
                size: layout.size(),
            })
        }
    }

    fn dealloc_block(ptr: NonNull<u8>, size: usize, align: usize) {
        unsafe { dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, align)) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        Self::dealloc_block(self.ptr, self.size, self.align);
    }
}
