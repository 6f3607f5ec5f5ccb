//! Size classes and occupancy bitmap addressing
//!
//! Requests below the big threshold are rounded up to a multiple of
//! the alignment granularity (the "fit size") and every fit size has
//! its own size class, served by one chain of slabs. Slab occupancy
//! is tracked in bitmap words whose width is independent of the
//! granularity.

use bitmaps::Bitmap;

use super::error::MemoryError;

/// Width in bits of each occupancy bitmap word
pub const BITMAP_WORD_BITS: usize = 32;

/// One word of slab occupancy
pub type BitmapWord = Bitmap<BITMAP_WORD_BITS>;

/// Raw value of a bitmap word
pub type WordValue = u32;

/// Default rounding granularity for small requests
pub const DEFAULT_GRANULARITY: usize = 32;

/// Default size at and above which requests bypass the slabs
pub const DEFAULT_BIG_THRESHOLD: usize = 256;

/// Number of bitmap words needed to cover `capacity` slots
pub fn words_for(capacity: usize) -> usize {
    capacity.div_ceil(BITMAP_WORD_BITS)
}

/// Round `capacity` up to a whole number of bitmap words
pub fn round_to_words(capacity: usize) -> usize {
    words_for(capacity.max(1)) * BITMAP_WORD_BITS
}

/// Stateless policy mapping request sizes to size classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassPolicy {
    granularity: usize,
    threshold: usize,
}

impl Default for SizeClassPolicy {
    fn default() -> Self {
        SizeClassPolicy {
            granularity: DEFAULT_GRANULARITY,
            threshold: DEFAULT_BIG_THRESHOLD,
        }
    }
}

impl SizeClassPolicy {
    pub fn new(granularity: usize, threshold: usize) -> Result<Self, MemoryError> {
        if !granularity.is_power_of_two() {
            return Err(MemoryError::BadSettings(format!(
                "granularity {granularity} is not a power of two"
            )));
        }
        if threshold == 0 || threshold % granularity != 0 {
            return Err(MemoryError::BadSettings(format!(
                "big threshold {threshold} is not a positive multiple of granularity {granularity}"
            )));
        }
        Ok(SizeClassPolicy {
            granularity,
            threshold,
        })
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Requests of this size go straight to the system heap
    pub fn is_big(&self, size: usize) -> bool {
        size >= self.threshold
    }

    /// Round `size` up to the nearest multiple of the granularity
    pub fn fit_size(&self, size: usize) -> usize {
        (size + (self.granularity - 1)) & !(self.granularity - 1)
    }

    /// Bucket index for a fit size. Monotonic in the fit size.
    pub fn size_class_index(&self, fit_size: usize) -> usize {
        debug_assert!(fit_size > 0 && fit_size % self.granularity == 0);
        fit_size / self.granularity - 1
    }

    /// Size class serving a raw request size
    pub fn class_of(&self, size: usize) -> usize {
        self.size_class_index(self.fit_size(size.max(1)))
    }

    /// Slot size shared by every object in a class
    pub fn slot_size(&self, class: usize) -> usize {
        (class + 1) * self.granularity
    }

    /// Number of size classes below the threshold
    pub fn class_count(&self) -> usize {
        self.threshold / self.granularity
    }
}

/// Position of a slot's bit within a slab's occupancy bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorCoordinate {
    /// Slot index within the slab
    pub index: usize,
    /// Bitmap word holding the slot's bit
    pub word_index: usize,
    /// Bit position within that word
    pub bit_offset: usize,
    /// Single-bit mask for the word
    pub bit_mask: WordValue,
}

impl DescriptorCoordinate {
    pub fn for_index(index: usize) -> Self {
        let bit_offset = index % BITMAP_WORD_BITS;
        DescriptorCoordinate {
            index,
            word_index: index / BITMAP_WORD_BITS,
            bit_offset,
            bit_mask: 1 << bit_offset,
        }
    }
}

/// Locate the slot containing `ptr` in a slab at `base`.
///
/// Interior pointers resolve to the slot that contains them. `None`
/// means the pointer is not inside the slab; callers treat that as a
/// contract violation.
pub fn locate(
    base: usize,
    capacity: usize,
    slot_size: usize,
    ptr: usize,
) -> Option<DescriptorCoordinate> {
    if ptr < base {
        return None;
    }
    let index = (ptr - base) / slot_size;
    if index >= capacity {
        None
    } else {
        Some(DescriptorCoordinate::for_index(index))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_fit_size() {
        let policy = SizeClassPolicy::default();
        assert_eq!(policy.fit_size(1), 32);
        assert_eq!(policy.fit_size(32), 32);
        assert_eq!(policy.fit_size(33), 64);
        assert_eq!(policy.fit_size(255), 256);
    }

    #[test]
    pub fn test_class_index_is_monotonic() {
        let policy = SizeClassPolicy::default();
        let mut last = 0;
        for size in 1..policy.threshold() {
            let class = policy.class_of(size);
            assert!(class >= last);
            assert!(class < policy.class_count());
            assert!(policy.slot_size(class) >= size);
            last = class;
        }
        assert_eq!(policy.class_count(), 8);
        assert_eq!(policy.class_of(17), 0);
        assert_eq!(policy.class_of(200), 6);
    }

    #[test]
    pub fn test_big_threshold() {
        let policy = SizeClassPolicy::default();
        assert!(!policy.is_big(255));
        assert!(policy.is_big(256));
        assert!(policy.is_big(4096));
    }

    #[test]
    pub fn test_bad_policies() {
        assert!(SizeClassPolicy::new(24, 240).is_err());
        assert!(SizeClassPolicy::new(32, 100).is_err());
        assert!(SizeClassPolicy::new(32, 0).is_err());
        assert!(SizeClassPolicy::new(16, 512).is_ok());
    }

    #[test]
    pub fn test_locate() {
        let base = 0x1000;
        let coord = locate(base, 64, 16, base + 16 * 35).unwrap();
        assert_eq!(coord.index, 35);
        assert_eq!(coord.word_index, 1);
        assert_eq!(coord.bit_offset, 3);
        assert_eq!(coord.bit_mask, 0b1000);

        // interior pointer resolves to its slot
        assert_eq!(locate(base, 64, 16, base + 16 * 35 + 7), Some(coord));

        assert_eq!(locate(base, 64, 16, base - 1), None);
        assert_eq!(locate(base, 64, 16, base + 16 * 64), None);
    }

    #[test]
    pub fn test_word_rounding() {
        assert_eq!(words_for(8), 1);
        assert_eq!(words_for(32), 1);
        assert_eq!(words_for(33), 2);
        assert_eq!(round_to_words(1), 32);
        assert_eq!(round_to_words(64), 64);
        assert_eq!(round_to_words(65), 96);
    }
}
