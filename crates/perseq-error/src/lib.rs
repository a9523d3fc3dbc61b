#![forbid(unsafe_code)]
//! Error types for perseq.
//!
//! Defines `PerseqError` and a `Result<T>` alias used throughout the
//! workspace. Runtime failures (I/O, bounds, corruption detected at open)
//! are errors; programmer errors such as double deallocation panic at the
//! call site instead of surfacing here.

use thiserror::Error;

/// Unified error type for all perseq operations.
#[derive(Debug, Error)]
pub enum PerseqError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer is read-only")]
    ReadOnly,

    #[error("buffer is closed")]
    Closed,

    #[error("position {position} beyond capacity {capacity}")]
    CapacityExceeded { position: u64, capacity: u64 },

    #[error("stream underflow: requested {requested} bytes with {remaining} remaining")]
    StreamUnderflow { requested: u64, remaining: u64 },

    #[error("stream overflow: requested {requested} bytes with {remaining} remaining")]
    StreamOverflow { requested: u64, remaining: u64 },

    #[error("block {id} is not allocated")]
    NotAllocated { id: u64 },

    #[error("corrupt persistent state: {0}")]
    Corruption(String),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("structure modified during iteration")]
    ConcurrentModification,

    #[error("list is at maximum size")]
    ListFull,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result alias using `PerseqError`.
pub type Result<T> = std::result::Result<T, PerseqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = PerseqError::CapacityExceeded {
            position: 100,
            capacity: 64,
        };
        assert_eq!(err.to_string(), "position 100 beyond capacity 64");

        let err = PerseqError::Corruption("head points to unallocated block 42".into());
        assert!(err.to_string().contains("unallocated block 42"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = PerseqError::from(io);
        assert!(matches!(err, PerseqError::Io(_)));
    }
}
