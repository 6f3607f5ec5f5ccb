//! The memory model
//!
//! Small requests are served from size class slab chains, big ones
//! straight from the system allocator via a side table. Reclamation is
//! either explicit (`deallocate`) or by epoch: `prepare_for_gc`, then a
//! `mark` for every reachable object, then `sweep`.

use std::fmt::Debug;
use std::ptr::NonNull;
#[cfg(any(debug_assertions, feature = "gc-telemetry"))]
use std::time::Instant;

use super::alloc::{AllocationEvent, AllocationHook, Allocator};
use super::error::{MemoryError, OrTrap};
use super::lob::{BigTable, Leak};
use super::router::SizeClassRouter;
use super::settings::{GrowthPolicy, MemorySettings};
use super::size_class::{round_to_words, SizeClassPolicy};
use super::stats::{ClassStats, CollectionStats, MemoryStats};

/// Where the model is in the mark and sweep epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Allocation and deallocation permitted
    Idle,
    /// Between `prepare_for_gc` and `sweep`
    Marking,
}

pub struct MemoryModel {
    settings: MemorySettings,
    policy: SizeClassPolicy,
    router: SizeClassRouter,
    big: BigTable,
    growth: GrowthPolicy,
    phase: GcPhase,
    /// Bytes in live slots and big allocations
    used: usize,
    peak: usize,
    /// Footprint of prewarmed slabs
    initial: usize,
    /// Successful allocations so far
    serial: u64,
    hook: Option<AllocationHook>,
    collections: CollectionStats,
    #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
    cycle_started: Option<Instant>,
}

impl Debug for MemoryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:?} used:{} peak:{}", self.phase, self.used, self.peak)?;
        write!(f, "{:?}", self.router)?;
        for allocation in self.big.iter() {
            writeln!(f, "(big) {:p} {}B", allocation.ptr(), allocation.size())?;
        }
        Ok(())
    }
}

impl Default for MemoryModel {
    fn default() -> Self {
        Self::new(MemorySettings::default()).or_trap()
    }
}

impl MemoryModel {
    pub fn new(settings: MemorySettings) -> Result<Self, MemoryError> {
        let growth = settings.growth_policy();
        Self::with_growth_policy(settings, growth)
    }

    /// Construct with a custom slab growth function. The result of the
    /// function is rounded up to whole bitmap words.
    pub fn with_growth_policy(
        settings: MemorySettings,
        growth: GrowthPolicy,
    ) -> Result<Self, MemoryError> {
        settings.validate()?;
        let policy = settings.policy()?;
        let poison = settings.poison();

        let mut model = MemoryModel {
            router: SizeClassRouter::new(policy, poison),
            big: BigTable::new(poison),
            settings,
            policy,
            growth,
            phase: GcPhase::Idle,
            used: 0,
            peak: 0,
            initial: 0,
            serial: 0,
            hook: None,
            collections: CollectionStats::default(),
            #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
            cycle_started: None,
        };

        if model.settings.prewarm {
            for class in 0..policy.class_count() {
                model.router.grow(class, model.settings.initial_capacity)?;
            }
            model.initial = model.router.footprint();
            log::debug!(
                "prewarmed {} size classes, {} bytes",
                policy.class_count(),
                model.initial
            );
        }

        Ok(model)
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Install a callback to observe every successful allocation
    pub fn set_allocation_hook(&mut self, hook: Option<AllocationHook>) {
        self.hook = hook;
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), MemoryError> {
        match self.phase {
            GcPhase::Idle => Ok(()),
            GcPhase::Marking => Err(MemoryError::MarkInProgress { operation }),
        }
    }

    /// Allocate `size` bytes. `Ok(None)` for a zero size.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, MemoryError> {
        self.require_idle("allocate")?;
        if size == 0 {
            return Ok(None);
        }

        let (ptr, charged) = if self.policy.is_big(size) {
            (self.big.insert(size)?, size)
        } else {
            (self.allocate_small(size)?, self.policy.fit_size(size))
        };

        self.used += charged;
        self.peak = self.peak.max(self.used);
        self.serial += 1;
        if let Some(hook) = self.hook.as_mut() {
            hook(&AllocationEvent {
                serial: self.serial,
                size,
                ptr,
            });
        }
        Ok(Some(ptr))
    }

    fn allocate_small(&mut self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        if let Some(ptr) = self.router.allocate(size) {
            return Ok(ptr);
        }

        let class = self.policy.class_of(size);
        let capacity = match self.router.head(class) {
            Some(head) => round_to_words((self.growth)(head.capacity())),
            None => self.settings.initial_capacity,
        };
        self.router.grow(class, capacity)?;
        self.router
            .allocate(size)
            .ok_or(MemoryError::OutOfMemory { requested: size })
    }

    /// Free `ptr`, which must have been allocated with `size`
    pub fn try_deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        self.require_idle("deallocate")?;
        if size == 0 {
            return Ok(());
        }

        if self.policy.is_big(size) {
            self.big.remove(ptr, size)?;
            self.used -= size;
        } else {
            self.router.free(ptr, size)?;
            self.used -= self.policy.fit_size(size);
        }
        Ok(())
    }

    /// Begin a mark cycle
    pub fn try_prepare_for_gc(&mut self) -> Result<(), MemoryError> {
        self.require_idle("prepare_for_gc")?;
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.cycle_started = Some(Instant::now());
        }
        self.router.begin_mark_cycle();
        self.big.clear_seen();
        self.phase = GcPhase::Marking;
        log::debug!("mark cycle begins with {} bytes used", self.used);
        Ok(())
    }

    /// Mark the object at `ptr` reachable, returning whether the mark
    /// is new. Interior pointers mark their containing object.
    pub fn try_mark(&mut self, ptr: NonNull<u8>, size: usize) -> Result<bool, MemoryError> {
        if self.phase != GcPhase::Marking {
            return Err(MemoryError::NoMarkCycle { operation: "mark" });
        }
        if size == 0 {
            return Ok(false);
        }

        if !self.policy.is_big(size) {
            if let Some(marked) = self.router.try_mark(ptr, size)? {
                return Ok(marked);
            }
        }
        self.big.mark(ptr).ok_or(MemoryError::ForeignPointer {
            addr: ptr.as_ptr() as usize,
            size,
        })
    }

    /// Reclaim everything unmarked and end the cycle. Without a
    /// preceding `prepare_for_gc` nothing is marked, so everything is
    /// reclaimed.
    pub fn sweep(&mut self) {
        if self.phase != GcPhase::Marking {
            log::warn!("sweep without prepare_for_gc reclaims every allocation");
            self.big.clear_seen();
        }

        let before = self.used;
        let survivors = self.router.end_mark_cycle();
        let (big_released, _) = self.big.sweep();
        self.phase = GcPhase::Idle;

        self.used = self.router.used_bytes() + self.big.bytes();
        let reclaimed = before.saturating_sub(self.used);

        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        let elapsed = self.cycle_started.take().map(|start| start.elapsed());
        #[cfg(not(any(debug_assertions, feature = "gc-telemetry")))]
        let elapsed = None;
        self.collections.record(reclaimed, elapsed);

        log::debug!(
            "sweep kept {} slots and {} big allocations, released {} big, reclaimed {} bytes",
            survivors,
            self.big.len(),
            big_released,
            reclaimed
        );
    }

    /// Release every slab and big allocation without a cycle
    pub fn reset(&mut self) {
        self.router.clear();
        self.big.clear();
        self.phase = GcPhase::Idle;
        self.used = 0;
        #[cfg(any(debug_assertions, feature = "gc-telemetry"))]
        {
            self.cycle_started = None;
        }
        log::debug!("memory reset");
    }

    /// Bytes in live objects, rounded to slot sizes
    pub fn used_memory(&self) -> usize {
        self.used
    }

    pub fn peak_memory(&self) -> usize {
        self.peak
    }

    /// Bytes reserved from the system, including slab bookkeeping
    pub fn allocated_memory(&self) -> usize {
        self.router.footprint() + self.big.bytes()
    }

    /// Bytes reserved at construction by prewarming
    pub fn initial_size(&self) -> usize {
        self.initial
    }

    /// Is `ptr` within memory managed by this model
    pub fn inside(&self, ptr: NonNull<u8>, size: usize) -> bool {
        (!self.policy.is_big(size) && self.router.inside(ptr, size)) || self.big.contains(ptr)
    }

    /// Is the object at `ptr` allocated. Only meaningful if `inside`
    /// holds.
    pub fn alive(&self, ptr: NonNull<u8>, size: usize) -> bool {
        if !self.policy.is_big(size) && self.router.inside(ptr, size) {
            self.router.alive(ptr, size)
        } else {
            self.big.contains(ptr)
        }
    }

    /// Big allocations still live
    pub fn leaks(&self) -> Vec<Leak> {
        self.big.leaks()
    }

    pub fn stats(&self) -> MemoryStats {
        let mut classes = indexmap::IndexMap::new();
        for class in 0..self.policy.class_count() {
            let summary = self
                .router
                .chain(class)
                .fold(ClassStats::default(), |acc, slab| ClassStats {
                    slabs: acc.slabs + 1,
                    capacity: acc.capacity + slab.capacity(),
                    live: acc.live + slab.live_count(),
                });
            if summary.slabs > 0 {
                classes.insert(self.policy.slot_size(class), summary);
            }
        }

        MemoryStats {
            used: self.used,
            peak: self.peak,
            allocated: self.allocated_memory(),
            initial: self.initial,
            slabs: self.router.slab_count(),
            big_allocations: self.big.len(),
            big_bytes: self.big.bytes(),
            classes,
            collections: self.collections.clone(),
        }
    }
}

impl Drop for MemoryModel {
    fn drop(&mut self) {
        if self.settings.sanitize {
            for leak in self.big.leaks() {
                log::warn!(
                    "leaked big allocation {:?} of {} bytes at {:#x}",
                    leak.id,
                    leak.size,
                    leak.addr
                );
            }
        }
    }
}

impl Allocator for MemoryModel {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).or_trap()
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.try_deallocate(ptr, size).or_trap()
    }

    fn prepare_for_gc(&mut self) {
        self.try_prepare_for_gc().or_trap()
    }

    fn mark(&mut self, ptr: NonNull<u8>, size: usize) -> bool {
        self.try_mark(ptr, size).or_trap()
    }

    fn sweep(&mut self) {
        MemoryModel::sweep(self)
    }

    fn reset(&mut self) {
        MemoryModel::reset(self)
    }
}
