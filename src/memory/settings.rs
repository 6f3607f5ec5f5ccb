//! Memory configuration
//!
//! Settings can be flattened into a command line via `structopt`.

use structopt::StructOpt;

use super::error::MemoryError;
use super::size_class::{
    round_to_words, SizeClassPolicy, BITMAP_WORD_BITS, DEFAULT_BIG_THRESHOLD, DEFAULT_GRANULARITY,
};

/// Map from the current head slab capacity to the next slab's capacity
pub type GrowthPolicy = Box<dyn Fn(usize) -> usize>;

#[derive(StructOpt, Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    /// Rounding granularity for small allocations
    #[structopt(long = "heap-granularity", default_value = "32")]
    pub granularity: usize,
    /// Allocations of this size and above bypass the slabs
    #[structopt(long = "heap-big-threshold", default_value = "256")]
    pub big_threshold: usize,
    /// Slots in the first slab of each size class
    #[structopt(long = "heap-initial-capacity", default_value = "64")]
    pub initial_capacity: usize,
    /// Each new slab is this many times larger than the last
    #[structopt(long = "heap-growth-factor", default_value = "2")]
    pub growth_factor: usize,
    /// Upper limit on slots per slab
    #[structopt(long = "heap-max-slab-capacity", default_value = "65536")]
    pub max_slab_capacity: usize,
    /// Create a slab for every size class up front
    #[structopt(long = "heap-prewarm")]
    pub prewarm: bool,
    /// Poison freed memory and track big allocations for leaks
    #[structopt(long = "heap-sanitize")]
    pub sanitize: bool,
    /// Byte written over freed memory when sanitizing
    #[structopt(long = "heap-poison-byte", default_value = "221")]
    pub poison_byte: u8,
    /// Bytes reserved for the call stack
    #[structopt(long = "stack-size", default_value = "1048576")]
    pub stack_size: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings {
            granularity: DEFAULT_GRANULARITY,
            big_threshold: DEFAULT_BIG_THRESHOLD,
            initial_capacity: 64,
            growth_factor: 2,
            max_slab_capacity: 65536,
            prewarm: false,
            sanitize: false,
            poison_byte: 0xdd,
            stack_size: 1 << 20,
        }
    }
}

impl MemorySettings {
    /// Check the settings are coherent
    pub fn validate(&self) -> Result<(), MemoryError> {
        self.policy()?;
        for (name, value) in [
            ("initial slab capacity", self.initial_capacity),
            ("maximum slab capacity", self.max_slab_capacity),
        ] {
            if value == 0 || value % BITMAP_WORD_BITS != 0 {
                return Err(MemoryError::BadSettings(format!(
                    "{name} {value} is not a positive multiple of {BITMAP_WORD_BITS}"
                )));
            }
        }
        if self.max_slab_capacity < self.initial_capacity {
            return Err(MemoryError::BadSettings(format!(
                "maximum slab capacity {} is below initial capacity {}",
                self.max_slab_capacity, self.initial_capacity
            )));
        }
        if self.growth_factor == 0 {
            return Err(MemoryError::BadSettings(
                "growth factor must be at least 1".to_string(),
            ));
        }
        if self.stack_size == 0 {
            return Err(MemoryError::BadSettings(
                "stack size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> Result<SizeClassPolicy, MemoryError> {
        SizeClassPolicy::new(self.granularity, self.big_threshold)
    }

    /// Poison byte, if sanitizing
    pub fn poison(&self) -> Option<u8> {
        self.sanitize.then_some(self.poison_byte)
    }

    /// Multiply by the growth factor, clamped to the maximum
    pub fn growth_policy(&self) -> GrowthPolicy {
        let factor = self.growth_factor;
        let max = self.max_slab_capacity;
        Box::new(move |current| round_to_words(current.saturating_mul(factor).min(max)))
    }
}
