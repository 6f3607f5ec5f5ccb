//! Fixed capacity blocks of uniform slots with occupancy bitmaps
//!
//! A slab serves one size class. Bit *i* of the live bitmap is set
//! iff slot *i* is allocated. During a mark cycle a shadow bitmap
//! collects the marks; ending the cycle swaps the shadow in, which
//! reclaims every slot that was live but unmarked.
//!
//! Slabs of the same size class are chained through `next`.

use std::fmt::Debug;
use std::mem::size_of;
use std::ptr::NonNull;

use super::block::Block;
use super::error::MemoryError;
use super::size_class::{
    locate, words_for, BitmapWord, DescriptorCoordinate, WordValue, BITMAP_WORD_BITS,
};

/// A block of uniform slots belonging to one size class
pub struct Slab {
    /// Backing memory, `capacity * slot_size` bytes
    block: Block,
    /// Number of slots
    capacity: usize,
    /// Size of every slot
    slot_size: usize,
    /// Occupancy
    live: Vec<BitmapWord>,
    /// Marks collected during a cycle
    shadow: Option<Vec<BitmapWord>>,
    live_count: usize,
    shadow_count: usize,
    /// Word index where the next free-slot scan begins
    scan_cursor: usize,
    /// Byte written over reclaimed slots, if poisoning
    poison: Option<u8>,
    /// Next slab of the same size class
    next: Option<Box<Slab>>,
}

impl Slab {
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self, MemoryError> {
        Self::with_poison(capacity, slot_size, None)
    }

    pub fn with_poison(
        capacity: usize,
        slot_size: usize,
        poison: Option<u8>,
    ) -> Result<Self, MemoryError> {
        if capacity == 0 || slot_size == 0 {
            return Err(MemoryError::BadRequest(format!(
                "slab of {capacity} slots of {slot_size} bytes"
            )));
        }
        let bytes = capacity.checked_mul(slot_size).ok_or_else(|| {
            MemoryError::BadRequest(format!("slab of {capacity} slots of {slot_size} bytes"))
        })?;
        let block = Block::new(bytes, Self::slot_align(slot_size))?;
        if let Some(byte) = poison {
            block.fill(0, bytes, byte);
        }
        Ok(Slab {
            block,
            capacity,
            slot_size,
            live: vec![BitmapWord::new(); words_for(capacity)],
            shadow: None,
            live_count: 0,
            shadow_count: 0,
            scan_cursor: 0,
            poison,
            next: None,
        })
    }

    /// Largest power of two dividing the slot size, capped at a page
    fn slot_align(slot_size: usize) -> usize {
        1 << slot_size.trailing_zeros().min(12)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_full(&self) -> bool {
        self.live_count == self.capacity
    }

    pub fn is_marking(&self) -> bool {
        self.shadow.is_some()
    }

    /// Bytes of slot memory
    pub fn bytes(&self) -> usize {
        self.capacity * self.slot_size
    }

    /// Bytes spent on the slab record and its bitmaps, including the
    /// shadow bitmap while a mark cycle is in progress
    pub fn bookkeeping_bytes(&self) -> usize {
        let shadow = self.shadow.as_ref().map_or(0, Vec::len);
        size_of::<Self>() + (self.live.len() + shadow) * size_of::<WordValue>()
    }

    /// Total footprint of this slab alone
    pub fn footprint(&self) -> usize {
        self.bytes() + self.bookkeeping_bytes()
    }

    /// Count of set bits in the live bitmap
    pub fn popcount(&self) -> usize {
        self.live.iter().map(|w| w.len()).sum()
    }

    fn base(&self) -> usize {
        self.block.as_ptr() as usize
    }

    /// Bits of word `word_index` that correspond to real slots
    fn valid_mask(&self, word_index: usize) -> WordValue {
        let remainder = self.capacity % BITMAP_WORD_BITS;
        if word_index + 1 == self.live.len() && remainder != 0 {
            ((1 as WordValue) << remainder) - 1
        } else {
            WordValue::MAX
        }
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.capacity);
        // SAFETY: index is within capacity so the offset stays inside
        // the block, which is never null
        unsafe { NonNull::new_unchecked(self.block.as_mut_ptr().add(index * self.slot_size)) }
    }

    fn coordinate(&self, ptr: NonNull<u8>) -> Option<DescriptorCoordinate> {
        locate(
            self.base(),
            self.capacity,
            self.slot_size,
            ptr.as_ptr() as usize,
        )
    }

    fn poison_slot(&self, index: usize) {
        if let Some(byte) = self.poison {
            self.block
                .fill(index * self.slot_size, self.slot_size, byte);
        }
    }

    /// Claim a free slot, scanning from the cursor and wrapping
    pub fn allocate_slot(&mut self) -> Option<NonNull<u8>> {
        debug_assert!(self.shadow.is_none(), "slot allocation during mark cycle");
        if self.is_full() {
            return None;
        }

        let words = self.live.len();
        for step in 0..words {
            let word_index = (self.scan_cursor + step) % words;
            let free = !self.live[word_index].into_value() & self.valid_mask(word_index);
            if free != 0 {
                let bit = free.trailing_zeros() as usize;
                self.live[word_index].set(bit, true);
                self.live_count += 1;
                self.scan_cursor = word_index;
                return Some(self.slot_ptr(word_index * BITMAP_WORD_BITS + bit));
            }
        }

        None
    }

    /// Release the slot at `ptr`, which must be an exact slot address
    pub fn free_slot(&mut self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        let addr = ptr.as_ptr() as usize;
        if self.is_marking() {
            return Err(MemoryError::MarkInProgress { operation: "free" });
        }
        let coord = self
            .coordinate(ptr)
            .filter(|_| (addr - self.base()) % self.slot_size == 0)
            .ok_or(MemoryError::ForeignPointer {
                addr,
                size: self.slot_size,
            })?;

        if !self.live[coord.word_index].get(coord.bit_offset) {
            return Err(MemoryError::DoubleFree { addr });
        }

        self.live[coord.word_index].set(coord.bit_offset, false);
        self.live_count -= 1;
        self.poison_slot(coord.index);
        self.scan_cursor = coord.word_index;
        Ok(())
    }

    /// Does `ptr` point into this slab's slot memory
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.base() && addr < self.base() + self.bytes()
    }

    /// Is the slot containing `ptr` allocated. Only meaningful if
    /// `contains(ptr)` holds.
    pub fn is_live(&self, ptr: NonNull<u8>) -> bool {
        self.coordinate(ptr)
            .map(|c| self.live[c.word_index].get(c.bit_offset))
            .unwrap_or(false)
    }

    /// Start a mark cycle on this slab and every slab chained after it
    pub fn begin_mark_cycle(&mut self) {
        let mut slab = Some(self);
        while let Some(s) = slab {
            s.shadow = Some(vec![BitmapWord::new(); s.live.len()]);
            s.shadow_count = 0;
            slab = s.next.as_deref_mut();
        }
    }

    /// Mark the slot containing `ptr` as reachable.
    ///
    /// Returns whether the mark is new. Marking a free slot or marking
    /// twice has no effect.
    pub fn mark(&mut self, ptr: NonNull<u8>) -> Result<bool, MemoryError> {
        let coord = self.coordinate(ptr).ok_or(MemoryError::ForeignPointer {
            addr: ptr.as_ptr() as usize,
            size: self.slot_size,
        })?;
        let shadow = self
            .shadow
            .as_mut()
            .ok_or(MemoryError::NoMarkCycle { operation: "mark" })?;

        if !self.live[coord.word_index].get(coord.bit_offset)
            || shadow[coord.word_index].get(coord.bit_offset)
        {
            return Ok(false);
        }

        shadow[coord.word_index].set(coord.bit_offset, true);
        self.shadow_count += 1;
        Ok(true)
    }

    /// Finish the mark cycle on this slab and its chain, reclaiming
    /// unmarked slots. Returns the number of surviving slots.
    ///
    /// A slab with no cycle in progress is treated as having had
    /// nothing marked.
    pub fn end_mark_cycle(&mut self) -> usize {
        let mut survivors = 0;
        let mut slab = Some(self);
        while let Some(s) = slab {
            survivors += s.end_own_cycle();
            slab = s.next.as_deref_mut();
        }
        survivors
    }

    fn end_own_cycle(&mut self) -> usize {
        let (shadow, count) = match self.shadow.take() {
            Some(shadow) => (shadow, self.shadow_count),
            None => (vec![BitmapWord::new(); self.live.len()], 0),
        };

        if self.poison.is_some() {
            for (word_index, (live, kept)) in self.live.iter().zip(shadow.iter()).enumerate() {
                let mut dead = live.into_value() & !kept.into_value();
                while dead != 0 {
                    let bit = dead.trailing_zeros() as usize;
                    dead &= dead - 1;
                    self.poison_slot(word_index * BITMAP_WORD_BITS + bit);
                }
            }
        }

        self.live = shadow;
        self.live_count = count;
        self.shadow_count = 0;
        self.scan_cursor = 0;
        self.live_count
    }

    /// Forget every allocation in this slab without poisoning
    pub fn reset(&mut self) {
        for word in self.live.iter_mut() {
            *word = BitmapWord::new();
        }
        self.shadow = None;
        self.live_count = 0;
        self.shadow_count = 0;
        self.scan_cursor = 0;
    }

    pub fn next(&self) -> Option<&Slab> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut Slab> {
        self.next.as_deref_mut()
    }

    /// Chain `next` after this slab, returning whatever was there
    pub fn link(&mut self, next: Option<Box<Slab>>) -> Option<Box<Slab>> {
        std::mem::replace(&mut self.next, next)
    }

    /// Iterate this slab and those chained after it
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    /// Hex dump of the slot memory
    pub fn hex_dump(&self) -> String {
        pretty_hex::pretty_hex(&self.block.bytes(0, self.bytes()))
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // unlink iteratively so long chains don't recurse
        let mut next = self.next.take();
        while let Some(mut slab) = next {
            next = slab.next.take();
        }
    }
}

impl Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:p} {}x{}B live:{} cursor:{}{}",
            self.block.as_ptr(),
            self.capacity,
            self.slot_size,
            self.live_count,
            self.scan_cursor,
            if self.is_marking() { " (marking)" } else { "" }
        )?;
        for chunk in self.live.chunks(4) {
            for word in chunk {
                write!(f, "{:#010x} ", word.into_value())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Iterator over a chain of slabs
#[derive(Default)]
pub struct Chain<'a> {
    next: Option<&'a Slab>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Slab;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.take().map(|slab| {
            self.next = slab.next.as_deref();
            slab
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn addr(p: NonNull<u8>) -> usize {
        p.as_ptr() as usize
    }

    #[test]
    pub fn test_eight_slots_of_sixteen() {
        let mut slab = Slab::new(8, 16).unwrap();

        let slots: Vec<_> = (0..8).map(|_| slab.allocate_slot().unwrap()).collect();
        for pair in slots.windows(2) {
            assert_eq!(addr(pair[1]) - addr(pair[0]), 16);
        }
        assert_eq!(slab.allocate_slot(), None);

        slab.free_slot(slots[3]).unwrap();
        assert_eq!(slab.allocate_slot(), Some(slots[3]));
    }

    #[test]
    pub fn test_live_count_matches_popcount() {
        let mut slab = Slab::new(100, 32).unwrap();
        let mut held = vec![];
        for i in 0..90 {
            held.push(slab.allocate_slot().unwrap());
            if i % 3 == 0 {
                let p = held.remove(held.len() / 2);
                slab.free_slot(p).unwrap();
            }
            assert_eq!(slab.live_count(), slab.popcount());
        }
        for p in held.drain(..) {
            slab.free_slot(p).unwrap();
            assert_eq!(slab.live_count(), slab.popcount());
        }
        assert_eq!(slab.live_count(), 0);
    }

    #[test]
    pub fn test_distinct_slots_across_words() {
        let mut slab = Slab::new(70, 32).unwrap();
        let mut addrs: Vec<usize> = (0..70).map(|_| addr(slab.allocate_slot().unwrap())).collect();
        assert!(slab.is_full());
        assert_eq!(slab.allocate_slot(), None);
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 70);
        assert!(addrs.windows(2).all(|w| w[1] - w[0] >= 32));
    }

    #[test]
    pub fn test_double_free() {
        let mut slab = Slab::new(32, 32).unwrap();
        let p = slab.allocate_slot().unwrap();
        slab.free_slot(p).unwrap();
        assert_eq!(
            slab.free_slot(p),
            Err(MemoryError::DoubleFree { addr: addr(p) })
        );
    }

    #[test]
    pub fn test_free_foreign_and_interior() {
        let mut slab = Slab::new(32, 32).unwrap();
        let mut other = Slab::new(32, 32).unwrap();
        let p = slab.allocate_slot().unwrap();
        let q = other.allocate_slot().unwrap();

        assert!(matches!(
            slab.free_slot(q),
            Err(MemoryError::ForeignPointer { .. })
        ));

        let interior = NonNull::new(unsafe { p.as_ptr().add(8) }).unwrap();
        assert!(slab.contains(interior));
        assert!(matches!(
            slab.free_slot(interior),
            Err(MemoryError::ForeignPointer { .. })
        ));
    }

    #[test]
    pub fn test_mark_cycle_reclaims_unmarked() {
        let mut slab = Slab::new(32, 32).unwrap();
        let a = slab.allocate_slot().unwrap();
        let b = slab.allocate_slot().unwrap();

        slab.begin_mark_cycle();
        assert!(slab.mark(a).unwrap());
        assert!(!slab.mark(a).unwrap());
        assert_eq!(slab.end_mark_cycle(), 1);

        assert!(slab.is_live(a));
        assert!(!slab.is_live(b));
        assert_eq!(slab.live_count(), 1);
        assert_eq!(slab.allocate_slot(), Some(b));
    }

    #[test]
    pub fn test_mark_free_slot_is_ignored() {
        let mut slab = Slab::new(32, 32).unwrap();
        let a = slab.allocate_slot().unwrap();
        slab.free_slot(a).unwrap();
        slab.begin_mark_cycle();
        assert!(!slab.mark(a).unwrap());
        assert_eq!(slab.end_mark_cycle(), 0);
        assert_eq!(slab.popcount(), 0);
    }

    #[test]
    pub fn test_mark_outside_cycle() {
        let mut slab = Slab::new(32, 32).unwrap();
        let a = slab.allocate_slot().unwrap();
        assert_eq!(
            slab.mark(a),
            Err(MemoryError::NoMarkCycle { operation: "mark" })
        );
    }

    #[test]
    pub fn test_free_during_cycle() {
        let mut slab = Slab::new(32, 32).unwrap();
        let a = slab.allocate_slot().unwrap();
        slab.begin_mark_cycle();
        assert_eq!(
            slab.free_slot(a),
            Err(MemoryError::MarkInProgress { operation: "free" })
        );
    }

    #[test]
    pub fn test_end_without_begin_reclaims_all() {
        let mut slab = Slab::new(32, 32).unwrap();
        for _ in 0..10 {
            slab.allocate_slot().unwrap();
        }
        assert_eq!(slab.end_mark_cycle(), 0);
        assert_eq!(slab.live_count(), 0);
    }

    #[test]
    pub fn test_poisoning() {
        let mut slab = Slab::with_poison(32, 32, Some(0xdd)).unwrap();
        let a = slab.allocate_slot().unwrap();
        let b = slab.allocate_slot().unwrap();
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0x11, 32);
            std::ptr::write_bytes(b.as_ptr(), 0x22, 32);
        }

        slab.begin_mark_cycle();
        slab.mark(a).unwrap();
        slab.end_mark_cycle();

        let bytes = slab.block.bytes(0, 64);
        assert!(bytes[..32].iter().all(|x| *x == 0x11));
        assert!(bytes[32..].iter().all(|x| *x == 0xdd));
        assert!(slab.hex_dump().contains("dd dd"));
    }

    #[test]
    pub fn test_fresh_slab_dumps_zeroes() {
        let slab = Slab::new(32, 256).unwrap();
        assert!(slab.block.bytes(0, slab.bytes()).iter().all(|b| *b == 0));
        assert!(slab.hex_dump().contains("00 00"));
    }

    #[test]
    pub fn test_bookkeeping_counts_shadow() {
        let mut slab = Slab::new(64, 32).unwrap();
        let idle = slab.bookkeeping_bytes();
        slab.begin_mark_cycle();
        assert_eq!(slab.bookkeeping_bytes(), idle + 2 * size_of::<WordValue>());
        slab.end_mark_cycle();
        assert_eq!(slab.bookkeeping_bytes(), idle);
    }

    #[test]
    pub fn test_reset() {
        let mut slab = Slab::new(64, 32).unwrap();
        for _ in 0..40 {
            slab.allocate_slot().unwrap();
        }
        slab.begin_mark_cycle();
        slab.reset();
        assert!(!slab.is_marking());
        assert_eq!(slab.live_count(), 0);
        assert_eq!(slab.popcount(), 0);
    }

    #[test]
    pub fn test_chain_cycle() {
        let mut head = Slab::new(32, 32).unwrap();
        let mut tail = Slab::new(32, 32).unwrap();
        let t = tail.allocate_slot().unwrap();
        tail.allocate_slot().unwrap();
        let h = head.allocate_slot().unwrap();
        head.link(Some(Box::new(tail)));
        assert_eq!(head.chain().count(), 2);

        head.begin_mark_cycle();
        head.mark(h).unwrap();
        head.next_mut().unwrap().mark(t).unwrap();
        assert_eq!(head.end_mark_cycle(), 2);
        assert_eq!(head.chain().map(|s| s.live_count()).sum::<usize>(), 2);
    }

    #[test]
    pub fn test_bad_slab() {
        assert!(Slab::new(0, 32).is_err());
        assert!(Slab::new(32, 0).is_err());
    }
}
