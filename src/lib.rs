extern crate bitmaps;
extern crate indexmap;
extern crate log;
extern crate pretty_hex;
extern crate structopt;
extern crate thiserror;

pub mod memory;

pub use memory::alloc::{AllocationEvent, AllocationHook, Allocator};
pub use memory::error::MemoryError;
pub use memory::heap::{GcPhase, MemoryModel};
pub use memory::settings::MemorySettings;
pub use memory::stack::{StackAllocator, StackState};
pub use memory::stats::MemoryStats;
