//! Dispatch of small requests to per size class slab chains
//!
//! Each size class owns a chain of slabs. New slabs are linked at the
//! head of the chain so allocation favours the most recent growth.

use std::ptr::NonNull;

use super::error::MemoryError;
use super::size_class::SizeClassPolicy;
use super::slab::{Chain, Slab};

pub struct SizeClassRouter {
    policy: SizeClassPolicy,
    /// Head of the slab chain for each size class
    chains: Vec<Option<Box<Slab>>>,
    /// Byte written over reclaimed slots
    poison: Option<u8>,
}

impl SizeClassRouter {
    pub fn new(policy: SizeClassPolicy, poison: Option<u8>) -> Self {
        SizeClassRouter {
            policy,
            chains: (0..policy.class_count()).map(|_| None).collect(),
            poison,
        }
    }

    pub fn policy(&self) -> &SizeClassPolicy {
        &self.policy
    }

    /// The head of a size class's chain
    pub fn head(&self, class: usize) -> Option<&Slab> {
        self.chains.get(class).and_then(|c| c.as_deref())
    }

    /// Iterate every slab of a size class
    pub fn chain(&self, class: usize) -> Chain<'_> {
        match self.head(class) {
            Some(slab) => slab.chain(),
            None => Chain::default(),
        }
    }

    /// Iterate every slab of every size class
    pub fn slabs(&self) -> impl Iterator<Item = &Slab> {
        (0..self.chains.len()).flat_map(move |class| self.chain(class))
    }

    pub fn slab_count(&self) -> usize {
        self.slabs().count()
    }

    fn class_for(&self, size: usize) -> Result<usize, MemoryError> {
        if self.policy.is_big(size) {
            Err(MemoryError::BadRequest(format!(
                "{size} bytes is at or above the big threshold {}",
                self.policy.threshold()
            )))
        } else {
            Ok(self.policy.class_of(size))
        }
    }

    /// Allocate from the first slab in the chain with a free slot.
    ///
    /// `None` when the chain is exhausted; growth is left to the
    /// caller.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let class = self.class_for(size).ok()?;
        let mut slab = self.chains[class].as_deref_mut();
        while let Some(s) = slab {
            if let Some(ptr) = s.allocate_slot() {
                return Some(ptr);
            }
            slab = s.next_mut();
        }
        None
    }

    /// Link a fresh slab at the head of a size class's chain
    pub fn grow(&mut self, class: usize, capacity: usize) -> Result<&mut Slab, MemoryError> {
        if class >= self.chains.len() {
            return Err(MemoryError::BadRequest(format!(
                "size class {class} out of range"
            )));
        }
        let slot_size = self.policy.slot_size(class);
        let mut slab = Box::new(Slab::with_poison(capacity, slot_size, self.poison)?);
        slab.link(self.chains[class].take());
        log::debug!(
            "grew size class {} ({}B slots) by {} slots",
            class,
            slot_size,
            capacity
        );
        let head: &mut Slab = self.chains[class].insert(slab);
        Ok(head)
    }

    /// Free `ptr` in whichever slab of the size class holds it
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        let class = self.class_for(size)?;
        let mut slab = self.chains[class].as_deref_mut();
        while let Some(s) = slab {
            if s.contains(ptr) {
                return s.free_slot(ptr);
            }
            slab = s.next_mut();
        }
        Err(MemoryError::ForeignPointer {
            addr: ptr.as_ptr() as usize,
            size,
        })
    }

    /// Mark `ptr` if a slab of the size class holds it.
    ///
    /// `Ok(None)` when no slab claims the pointer.
    pub fn try_mark(&mut self, ptr: NonNull<u8>, size: usize) -> Result<Option<bool>, MemoryError> {
        let class = self.class_for(size)?;
        let mut slab = self.chains[class].as_deref_mut();
        while let Some(s) = slab {
            if s.contains(ptr) {
                return s.mark(ptr).map(Some);
            }
            slab = s.next_mut();
        }
        Ok(None)
    }

    /// Mark `ptr`, which must belong to a slab of the size class
    pub fn mark(&mut self, ptr: NonNull<u8>, size: usize) -> Result<bool, MemoryError> {
        self.try_mark(ptr, size)?
            .ok_or(MemoryError::ForeignPointer {
                addr: ptr.as_ptr() as usize,
                size,
            })
    }

    /// Is `ptr` inside a slab of the size class for `size`
    pub fn inside(&self, ptr: NonNull<u8>, size: usize) -> bool {
        self.owner(ptr, size).is_some()
    }

    /// Is `ptr` allocated. Only meaningful if `inside` holds.
    pub fn alive(&self, ptr: NonNull<u8>, size: usize) -> bool {
        self.owner(ptr, size)
            .map(|slab| slab.is_live(ptr))
            .unwrap_or(false)
    }

    fn owner(&self, ptr: NonNull<u8>, size: usize) -> Option<&Slab> {
        let class = self.class_for(size).ok()?;
        self.chain(class).find(|slab| slab.contains(ptr))
    }

    pub fn begin_mark_cycle(&mut self) {
        for slab in self.chains.iter_mut().flatten() {
            slab.begin_mark_cycle();
        }
    }

    /// Finish the cycle on every chain, returning surviving slot count
    pub fn end_mark_cycle(&mut self) -> usize {
        self.chains
            .iter_mut()
            .flatten()
            .map(|slab| slab.end_mark_cycle())
            .sum()
    }

    /// Forget every allocation but keep the slabs
    pub fn reset(&mut self) {
        for head in self.chains.iter_mut().flatten() {
            let mut slab = Some(head.as_mut());
            while let Some(s) = slab {
                s.reset();
                slab = s.next_mut();
            }
        }
    }

    /// Destroy every slab chain
    pub fn clear(&mut self) {
        for chain in self.chains.iter_mut() {
            *chain = None;
        }
    }

    /// Bytes of live slots
    pub fn used_bytes(&self) -> usize {
        self.slabs().map(|s| s.live_count() * s.slot_size()).sum()
    }

    /// Bytes reserved for slabs, including bookkeeping
    pub fn footprint(&self) -> usize {
        self.slabs().map(Slab::footprint).sum()
    }
}

impl std::fmt::Debug for SizeClassRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for class in 0..self.chains.len() {
            for slab in self.chain(class) {
                write!(f, "(C{class}) {slab:?}")?;
            }
        }
        Ok(())
    }
}
