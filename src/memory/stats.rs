//! Per-pool diagnostic counters.
//!
//! Counters use `Relaxed` ordering. Individual counter values are eventually
//! consistent when read from a thread other than the one mutating the pool.
//! A [`PoolStats`] snapshot taken by the pool owner is exact.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic gauge counter.
///
/// Readers always go through `get()`/`load()`, which never report a
/// negative value.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a single chunk pool.
///
/// `used + unused + pending == chunks_created - chunks_released` holds for
/// every snapshot taken through [`ChunkPool::stats`](super::chunk_pool::ChunkPool::stats).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes available to the caller in every chunk.
    pub data_size: usize,
    /// Chunks currently owned by application code.
    pub used: usize,
    /// Chunks on the real-time free-list.
    pub unused: usize,
    /// Chunks on the staging free-list. Always zero for single-threaded pools.
    pub pending: usize,
    /// Chunks obtained from the system allocator over the pool's lifetime.
    pub chunks_created: usize,
    /// Chunks handed back to the system allocator by maintenance or teardown.
    pub chunks_released: usize,
}

impl PoolStats {
    /// Chunks currently held by the pool, in use or not.
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        self.used + self.unused + self.pending
    }
}
