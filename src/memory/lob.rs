//! Big allocations
//!
//! Requests at or above the big threshold bypass the slabs. Each gets
//! its own system allocation, recorded in a side table keyed by
//! address so that frees can be checked against the recorded size and
//! sweeps can release whatever went unmarked.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use indexmap::IndexMap;

use super::error::MemoryError;

/// A memory allocation containing a single big object. Unlike slab
/// slots its size is exactly what was requested.
#[derive(Debug)]
pub struct BigAllocation {
    /// Pointer to memory
    ptr: NonNull<u8>,
    /// Size of allocation
    size: usize,
    /// Sequence number assigned in sanitizer mode
    id: Option<u64>,
    /// Marked during the current cycle
    seen: bool,
}

impl BigAllocation {
    pub fn new(size: usize, id: Option<u64>) -> Result<Self, MemoryError> {
        Ok(BigAllocation {
            ptr: Self::alloc_block(size)?,
            size,
            id,
            seen: false,
        })
    }

    /// Page alignment for big objects, never less than a word
    fn align_for(size: usize) -> usize {
        size.checked_next_power_of_two()
            .map_or(4096, |p| p.min(4096))
            .max(8)
    }

    fn alloc_block(size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size > isize::MAX as usize {
            return Err(MemoryError::BadRequest(format!(
                "big allocation of {size} bytes exceeds the address space"
            )));
        }
        let layout = Layout::from_size_align(size, Self::align_for(size))
            .map_err(|_| MemoryError::BadRequest(format!("big allocation of {size} bytes")))?;
        if layout.size() == 0 {
            return Err(MemoryError::BadRequest(
                "big allocation of zero bytes".to_string(),
            ));
        }
        // SAFETY: layout has non-zero size, checked above
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { requested: size })
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn is_seen(&self) -> bool {
        self.seen
    }

    /// Does `addr` fall within this allocation
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr() && addr < self.addr() + self.size
    }

    fn poison(&self, byte: u8) {
        // SAFETY: the allocation owns `size` bytes from `ptr`
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.size) }
    }
}

impl Drop for BigAllocation {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc_block with the same size and
        // alignment rule and is released exactly once here
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, Self::align_for(self.size));
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

/// A live big allocation reported by the leak check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leak {
    pub addr: usize,
    pub size: usize,
    pub id: Option<u64>,
}

/// Side table of every live big allocation
#[derive(Debug, Default)]
pub struct BigTable {
    entries: IndexMap<usize, BigAllocation>,
    /// Byte written over released allocations; also enables debug ids
    poison: Option<u8>,
    next_id: u64,
}

impl BigTable {
    pub fn new(poison: Option<u8>) -> Self {
        BigTable {
            entries: IndexMap::new(),
            poison,
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes held by big allocations
    pub fn bytes(&self) -> usize {
        self.entries.values().map(BigAllocation::size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BigAllocation> {
        self.entries.values()
    }

    /// Allocate and record `size` bytes
    pub fn insert(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let id = self.poison.map(|_| {
            self.next_id += 1;
            self.next_id
        });
        let allocation = BigAllocation::new(size, id)?;
        let ptr = allocation.ptr();
        log::debug!(
            "big allocation of {} bytes at {:p} (id {:?})",
            size,
            ptr.as_ptr(),
            id
        );
        self.entries.insert(allocation.addr(), allocation);
        Ok(ptr)
    }

    /// Release the allocation at `ptr`, which must have been recorded
    /// with exactly `size` bytes
    pub fn remove(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        let addr = ptr.as_ptr() as usize;
        let recorded = self
            .entries
            .get(&addr)
            .map(BigAllocation::size)
            .ok_or(MemoryError::ForeignPointer { addr, size })?;
        if recorded != size {
            return Err(MemoryError::SizeMismatch {
                addr,
                recorded,
                given: size,
            });
        }
        if let Some(allocation) = self.entries.shift_remove(&addr) {
            self.release(allocation);
        }
        Ok(())
    }

    fn release(&self, allocation: BigAllocation) {
        if let Some(byte) = self.poison {
            allocation.poison(byte);
        }
    }

    /// Find the allocation holding `addr`, interior pointers included
    fn find(&self, addr: usize) -> Option<&BigAllocation> {
        self.entries
            .get(&addr)
            .or_else(|| self.entries.values().find(|a| a.contains(addr)))
    }

    fn find_mut(&mut self, addr: usize) -> Option<&mut BigAllocation> {
        if self.entries.contains_key(&addr) {
            self.entries.get_mut(&addr)
        } else {
            self.entries.values_mut().find(|a| a.contains(addr))
        }
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.find(ptr.as_ptr() as usize).is_some()
    }

    /// Forget every mark ahead of a new cycle
    pub fn clear_seen(&mut self) {
        for allocation in self.entries.values_mut() {
            allocation.seen = false;
        }
    }

    /// Flag the allocation holding `ptr` as seen. `None` if there is
    /// none, otherwise whether the mark is new.
    pub fn mark(&mut self, ptr: NonNull<u8>) -> Option<bool> {
        self.find_mut(ptr.as_ptr() as usize)
            .map(|allocation| !std::mem::replace(&mut allocation.seen, true))
    }

    /// Release every allocation not seen this cycle, returning the
    /// count and bytes released
    pub fn sweep(&mut self) -> (usize, usize) {
        let (kept, dead): (IndexMap<_, _>, IndexMap<_, _>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|(_, allocation)| allocation.seen);
        self.entries = kept;

        let released = (dead.len(), dead.values().map(BigAllocation::size).sum());
        for (_, allocation) in dead {
            self.release(allocation);
        }
        released
    }

    /// Live allocations in allocation order
    pub fn leaks(&self) -> Vec<Leak> {
        self.entries
            .values()
            .map(|a| Leak {
                addr: a.addr(),
                size: a.size(),
                id: a.id(),
            })
            .collect()
    }

    /// Release everything without poisoning
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_alignment() {
        let a = BigAllocation::new(300, None).unwrap();
        assert_eq!(a.addr() % 512, 0);
        let b = BigAllocation::new(100_000, None).unwrap();
        assert_eq!(b.addr() % 4096, 0);
        assert_eq!(b.size(), 100_000);
    }

    #[test]
    pub fn test_insert_remove() {
        let mut table = BigTable::new(None);
        let p = table.insert(1000).unwrap();
        let q = table.insert(2000).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.bytes(), 3000);

        table.remove(p, 1000).unwrap();
        assert_eq!(table.bytes(), 2000);
        assert!(!table.contains(p));
        assert!(table.contains(q));
    }

    #[test]
    pub fn test_remove_checks_size() {
        let mut table = BigTable::new(None);
        let p = table.insert(1000).unwrap();
        assert_eq!(
            table.remove(p, 999),
            Err(MemoryError::SizeMismatch {
                addr: p.as_ptr() as usize,
                recorded: 1000,
                given: 999
            })
        );
        assert_eq!(table.len(), 1);

        table.remove(p, 1000).unwrap();
        assert!(matches!(
            table.remove(p, 1000),
            Err(MemoryError::ForeignPointer { .. })
        ));
    }

    #[test]
    pub fn test_mark_and_sweep() {
        let mut table = BigTable::new(None);
        let keep = table.insert(512).unwrap();
        let lose = table.insert(768).unwrap();

        table.clear_seen();
        assert_eq!(table.mark(keep), Some(true));
        assert_eq!(table.mark(keep), Some(false));
        assert_eq!(table.sweep(), (1, 768));

        assert!(table.contains(keep));
        assert!(!table.contains(lose));
        assert_eq!(table.bytes(), 512);
    }

    #[test]
    pub fn test_interior_mark() {
        let mut table = BigTable::new(None);
        let p = table.insert(1024).unwrap();
        let interior = NonNull::new(unsafe { p.as_ptr().add(600) }).unwrap();
        assert!(table.contains(interior));
        assert_eq!(table.mark(interior), Some(true));
        assert_eq!(table.sweep(), (0, 0));
    }

    #[test]
    pub fn test_debug_ids() {
        let mut table = BigTable::new(Some(0xdd));
        table.insert(300).unwrap();
        table.insert(400).unwrap();
        let ids: Vec<_> = table.leaks().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);

        let plain = {
            let mut t = BigTable::new(None);
            t.insert(300).unwrap();
            t.leaks()
        };
        assert_eq!(plain[0].id, None);
    }

    #[test]
    pub fn test_leaks_keep_allocation_order() {
        let mut table = BigTable::new(Some(0xdd));
        table.insert(300).unwrap();
        let second = table.insert(400).unwrap();
        table.insert(500).unwrap();
        table.insert(600).unwrap();
        table.remove(second, 400).unwrap();

        let ids: Vec<_> = table.leaks().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![Some(1), Some(3), Some(4)]);
    }

    #[test]
    pub fn test_oversized_request() {
        assert_eq!(BigAllocation::align_for(usize::MAX), 4096);
        assert!(matches!(
            BigAllocation::new(usize::MAX - 4096, None),
            Err(MemoryError::BadRequest(_))
        ));
        let mut table = BigTable::new(None);
        assert!(table.insert(usize::MAX).is_err());
        assert!(table.is_empty());
    }
}
