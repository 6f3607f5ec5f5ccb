//! Memory errors and the trap primitive
//!
//! Recoverable conditions (stack overflow) come back as `Err` values
//! for the caller to surface. Everything else is a broken invariant
//! and goes through [`trap`], which logs and halts.

use thiserror::Error;

use super::block::BlockError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of memory: failed to reserve {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("invalid memory settings: {0}")]
    BadSettings(String),
    #[error("pointer {addr:#x} ({size} bytes) does not belong to this heap")]
    ForeignPointer { addr: usize, size: usize },
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },
    #[error("size mismatch freeing {addr:#x}: recorded {recorded} bytes, given {given}")]
    SizeMismatch {
        addr: usize,
        recorded: usize,
        given: usize,
    },
    #[error("{operation} is not permitted while a mark cycle is in progress")]
    MarkInProgress { operation: &'static str },
    #[error("{operation} requires a mark cycle in progress")]
    NoMarkCycle { operation: &'static str },
    #[error("stack overflow: requested {requested} bytes with {usable} usable")]
    StackOverflow { requested: usize, usable: usize },
    #[error("stack offset {offset} lies outside a {size} byte buffer")]
    StackOffset { offset: usize, size: usize },
    #[error("stack buffer released while {aliases} alias(es) still hold it")]
    AliasedStackBuffer { aliases: usize },
    #[error("stack buffer released by a view that does not own it")]
    NotStackOwner,
}

impl From<BlockError> for MemoryError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::BadSize { size, align } => {
                MemoryError::BadRequest(format!("block of {size} bytes aligned to {align}"))
            }
            BlockError::OOM { size } => MemoryError::OutOfMemory { requested: size },
        }
    }
}

/// Halt on a broken memory invariant.
///
/// Release builds are compiled with `panic = "abort"` so this stops
/// the process outright; test builds unwind so violations can be
/// asserted.
#[cold]
#[track_caller]
pub fn trap(error: MemoryError) -> ! {
    log::error!("memory trap: {}", error);
    panic!("memory trap: {}", error)
}

/// Unwrap a memory result or trap
pub trait OrTrap<T> {
    fn or_trap(self) -> T;
}

impl<T> OrTrap<T> for Result<T, MemoryError> {
    #[track_caller]
    fn or_trap(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => trap(e),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_block_error_conversion() {
        let e: MemoryError = BlockError::OOM { size: 64 }.into();
        assert_eq!(e, MemoryError::OutOfMemory { requested: 64 });

        let e: MemoryError = BlockError::BadSize { size: 0, align: 8 }.into();
        assert!(matches!(e, MemoryError::BadRequest(_)));
    }

    #[test]
    pub fn test_messages() {
        let e = MemoryError::SizeMismatch {
            addr: 0x1000,
            recorded: 512,
            given: 256,
        };
        let message = format!("{}", e);
        assert!(message.contains("0x1000"));
        assert!(message.contains("512"));
        assert!(message.contains("256"));
    }

    #[test]
    #[should_panic(expected = "double free")]
    pub fn test_or_trap_panics() {
        let r: Result<(), MemoryError> = Err(MemoryError::DoubleFree { addr: 0x40 });
        r.or_trap();
    }
}
