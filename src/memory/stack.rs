//! Call stack storage for evaluator frames
//!
//! A downward growing bump allocator over one fixed buffer. `push`
//! reserves space below the allocation cursor and makes it the
//! current frame; `pop` restores a previous state. `invoke` moves
//! the frame cursor alone, for frames addressed at a fixed offset
//! from the bottom of the buffer.
//!
//! Sibling allocators may share one buffer. The buffer is reference
//! counted so it is released once, when the last view drops it; the
//! owning view may additionally `destroy` it, which is only legal once
//! every other view has faded.

use std::ptr::NonNull;
use std::rc::Rc;

use super::block::Block;
use super::error::{trap, MemoryError};
use super::settings::MemorySettings;

/// Alignment of the stack buffer
const STACK_ALIGN: usize = 16;

/// Cursor positions, as byte offsets from the bottom of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackState {
    /// Lower bound of reserved space
    pub allocation_top: usize,
    /// Base of the active frame
    pub evaluation_top: usize,
}

#[derive(Debug)]
pub struct StackAllocator {
    buffer: Option<Rc<Block>>,
    /// Whether this view may destroy the buffer
    owning: bool,
    allocation_top: usize,
    evaluation_top: usize,
}

impl StackAllocator {
    /// Allocate a fresh owned buffer of `size` bytes
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let block = Block::new(size, STACK_ALIGN)?;
        log::debug!("stack buffer of {} bytes at {:p}", size, block.as_ptr());
        Ok(StackAllocator {
            buffer: Some(Rc::new(block)),
            owning: true,
            allocation_top: size,
            evaluation_top: size,
        })
    }

    pub fn with_settings(settings: &MemorySettings) -> Result<Self, MemoryError> {
        Self::new(settings.stack_size)
    }

    /// A non-owning view of `other`'s buffer, starting from its
    /// current state
    pub fn shared_with(other: &StackAllocator) -> Self {
        StackAllocator {
            buffer: other.buffer.clone(),
            owning: false,
            allocation_top: other.allocation_top,
            evaluation_top: other.evaluation_top,
        }
    }

    /// Size of the buffer; zero once faded or destroyed
    pub fn size(&self) -> usize {
        self.buffer.as_ref().map(|b| b.size()).unwrap_or(0)
    }

    pub fn is_owner(&self) -> bool {
        self.owning
    }

    pub fn state(&self) -> StackState {
        StackState {
            allocation_top: self.allocation_top,
            evaluation_top: self.evaluation_top,
        }
    }

    /// Bytes reserved by pushes
    pub fn used(&self) -> usize {
        self.size() - self.allocation_top
    }

    /// Bytes still available to push
    pub fn usable(&self) -> usize {
        self.allocation_top
    }

    fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        self.buffer.as_ref().and_then(|b| {
            debug_assert!(offset <= b.size());
            NonNull::new(b.as_mut_ptr().wrapping_add(offset))
        })
    }

    /// Base of the active frame
    pub fn evaluation_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr_at(self.evaluation_top)
    }

    /// Lowest reserved byte
    pub fn allocation_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr_at(self.allocation_top)
    }

    /// Reserve `size` bytes as a new frame, returning the state to
    /// restore with `pop`. On overflow nothing changes.
    pub fn push(&mut self, size: usize) -> Result<StackState, MemoryError> {
        let usable = self.usable();
        if size > usable {
            return Err(MemoryError::StackOverflow {
                requested: size,
                usable,
            });
        }
        let previous = self.state();
        self.allocation_top -= size;
        self.evaluation_top = self.allocation_top;
        Ok(previous)
    }

    /// Restore a state returned by `push`, `invoke` or `push_invoke`.
    /// States must be restored in reverse order.
    pub fn pop(&mut self, state: StackState) {
        debug_assert!(state.allocation_top <= self.size());
        self.allocation_top = state.allocation_top;
        self.evaluation_top = state.evaluation_top;
    }

    /// Move the frame cursor to `offset` bytes above the bottom
    pub fn invoke(&mut self, offset: usize) -> StackState {
        if offset > self.size() {
            trap(MemoryError::StackOffset {
                offset,
                size: self.size(),
            });
        }
        let previous = self.state();
        self.evaluation_top = offset;
        previous
    }

    /// `push` then `invoke`, returning the state before both
    pub fn push_invoke(&mut self, size: usize, offset: usize) -> Result<StackState, MemoryError> {
        let previous = self.push(size)?;
        self.invoke(offset);
        Ok(previous)
    }

    /// Release every frame
    pub fn reset(&mut self) {
        self.allocation_top = self.size();
        self.evaluation_top = self.size();
    }

    /// Give up this view of the buffer without releasing it
    pub fn fade(&mut self) {
        self.buffer = None;
        self.owning = false;
        self.allocation_top = 0;
        self.evaluation_top = 0;
    }

    /// Release the buffer. Only the owning view may do so, and only
    /// once every shared view has faded.
    pub fn destroy(&mut self) {
        if !self.owning {
            trap(MemoryError::NotStackOwner);
        }
        if let Some(buffer) = &self.buffer {
            let views = Rc::strong_count(buffer);
            if views > 1 {
                trap(MemoryError::AliasedStackBuffer { aliases: views - 1 });
            }
        }
        log::debug!("stack buffer of {} bytes released", self.size());
        self.fade();
    }
}
