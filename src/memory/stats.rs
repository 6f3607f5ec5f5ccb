//! Memory usage reporting

use std::fmt::Display;
use std::time::Duration;

use indexmap::IndexMap;

/// Occupancy of one size class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub slabs: usize,
    /// Total slots across the class's slabs
    pub capacity: usize,
    /// Allocated slots
    pub live: usize,
}

/// Mark and sweep history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Number of sweeps performed
    pub collections: u64,
    /// Bytes reclaimed by the last sweep
    pub last_reclaimed: usize,
    /// Bytes reclaimed by every sweep
    pub total_reclaimed: usize,
    /// Time from prepare to end of sweep, summed (debug builds or
    /// `gc-telemetry` only)
    pub total_time: Duration,
    pub last_time: Option<Duration>,
}

impl CollectionStats {
    pub fn record(&mut self, reclaimed: usize, elapsed: Option<Duration>) {
        self.collections += 1;
        self.last_reclaimed = reclaimed;
        self.total_reclaimed += reclaimed;
        if let Some(elapsed) = elapsed {
            self.total_time += elapsed;
        }
        self.last_time = elapsed;
    }
}

/// Snapshot of a memory model's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes in live slots and big allocations
    pub used: usize,
    /// High water mark of `used`
    pub peak: usize,
    /// Bytes reserved from the system, bookkeeping included
    pub allocated: usize,
    /// Bytes reserved at construction
    pub initial: usize,
    pub slabs: usize,
    pub big_allocations: usize,
    pub big_bytes: usize,
    /// Per size class breakdown keyed by slot size
    pub classes: IndexMap<usize, ClassStats>,
    pub collections: CollectionStats,
}

impl Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Used Bytes      : {:10}", self.used)?;
        writeln!(f, "Peak Bytes      : {:10}", self.peak)?;
        writeln!(f, "Allocated Bytes : {:10}", self.allocated)?;
        writeln!(f, "Initial Bytes   : {:10}", self.initial)?;
        writeln!(f, "Slabs           : {:10}", self.slabs)?;
        writeln!(
            f,
            "Big Allocations : {:10} ({} bytes)",
            self.big_allocations, self.big_bytes
        )?;
        writeln!(f)?;

        for (slot_size, class) in &self.classes {
            writeln!(
                f,
                "{:>6}B slots: {:4} slabs {:10}/{:<10} live",
                slot_size, class.slabs, class.live, class.capacity
            )?;
        }
        if !self.classes.is_empty() {
            writeln!(f)?;
        }

        writeln!(
            f,
            "Collections     : {:10}",
            self.collections.collections
        )?;
        writeln!(
            f,
            "Last Reclaimed  : {:10}",
            self.collections.last_reclaimed
        )?;
        if let Some(last) = self.collections.last_time {
            writeln!(f, "Last GC Time    : {:14.9}s", last.as_secs_f64())?;
            writeln!(
                f,
                "Total GC Time   : {:14.9}s",
                self.collections.total_time.as_secs_f64()
            )?;
        }
        Ok(())
    }
}
