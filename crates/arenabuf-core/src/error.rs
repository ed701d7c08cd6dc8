//! Caller-facing errors.
//!
//! Internal consistency checks (run map contents, subpage bits, usage
//! arithmetic) are debug assertions and never surface here.

use arenabuf_membrane::{RefCntError, RegionError};
use thiserror::Error;

use crate::config::ConfigError;

/// Failure to obtain pooled memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Backing memory could not be obtained.
    #[error("could not allocate {requested} bytes")]
    Exhausted {
        requested: usize,
        #[source]
        source: RegionError,
    },
    /// `min_capacity` is larger than `max_capacity`.
    #[error("initial capacity {min} exceeds maximum capacity {max}")]
    InvalidCapacity { min: usize, max: usize },
    /// The request exceeds the pool's configured maximum capacity.
    #[error("requested capacity {requested} exceeds maximum {max}")]
    CapacityExceeded { requested: usize, max: usize },
    /// The allocation was handed out by another pool.
    #[error("allocation from arena {arena} of another pool")]
    ForeignAllocation { arena: usize },
    /// The pool configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a buffer operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Illegal retain/release (retain after free, double free).
    #[error(transparent)]
    RefCnt(#[from] RefCntError),
    /// The buffer's memory has already been returned to the pool.
    #[error("buffer already released")]
    Released,
    /// Access outside the buffer's capacity.
    #[error("index {index} + length {len} out of bounds for capacity {capacity}")]
    OutOfBounds {
        index: usize,
        len: usize,
        capacity: usize,
    },
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

impl AllocError {
    pub(crate) fn exhausted(requested: usize, source: RegionError) -> Self {
        tracing::warn!(size = requested, error = %source, "backing memory exhausted");
        Self::Exhausted { requested, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn exhausted_keeps_source() {
        let err = AllocError::exhausted(1 << 20, RegionError::OutOfMemory { size: 1 << 20 });
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "could not allocate 1048576 bytes");
    }

    #[test]
    fn refcnt_errors_convert() {
        let err: BufferError = RefCntError::ZeroDelta.into();
        assert!(matches!(err, BufferError::RefCnt(RefCntError::ZeroDelta)));
    }

    #[test]
    fn out_of_bounds_message() {
        let err = BufferError::OutOfBounds {
            index: 10,
            len: 4,
            capacity: 12,
        };
        assert_eq!(
            err.to_string(),
            "index 10 + length 4 out of bounds for capacity 12"
        );
    }
}
