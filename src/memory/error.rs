use thiserror::Error;

/// Construction-time failures. No partially built pool or allocator is ever
/// returned alongside one of these.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid preallocation bounds: min {min} exceeds max {max}")]
    InvalidPreallocation { min: usize, max: usize },

    #[error("chunk data size {data_size} does not fit a single allocation")]
    ChunkTooLarge { data_size: usize },

    #[error("maximum request size {max_size} needs more size classes than fit in a usize")]
    SizeClassOverflow { max_size: usize },
}

/// Failures reported by [`TieredAllocator::allocate`](super::tiered::TieredAllocator::allocate).
///
/// Both variants are plain data so they can be produced on the real-time path
/// without touching the heap.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The matching size class has no chunk ready. Transient; maintenance
    /// will refill it.
    #[error("no {chunk_size}-byte chunk available")]
    Exhausted { chunk_size: usize },

    /// The request is larger than the allocator was configured for. This is a
    /// configuration error, not memory pressure.
    #[error("request of {requested} bytes exceeds configured maximum of {max_size} bytes")]
    Oversized { requested: usize, max_size: usize },
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PoolError::InvalidPreallocation { min: 8, max: 2 };
        assert_eq!(err.to_string(), "invalid preallocation bounds: min 8 exceeds max 2");

        let err = AllocError::Oversized { requested: 5000, max_size: 4096 };
        assert_eq!(
            err.to_string(),
            "request of 5000 bytes exceeds configured maximum of 4096 bytes"
        );

        let err = AllocError::Exhausted { chunk_size: 924 };
        assert_eq!(err.to_string(), "no 924-byte chunk available");
    }
}
