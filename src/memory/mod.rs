//! Allocation and memory management for the runtime
pub mod alloc;
pub mod block;
pub mod error;
pub mod heap;
pub mod lob;
pub mod router;
pub mod settings;
pub mod size_class;
pub mod slab;
pub mod stack;
pub mod stats;
