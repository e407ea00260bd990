//! Real-time-safe memory allocation.
//!
//! A latency-sensitive thread (an audio callback, a control loop) cannot call
//! the general-purpose allocator: page faults, global locks and heap walks
//! make its latency unbounded. This crate preallocates fixed-size chunks on a
//! maintenance thread and lets the real-time thread only pop and push list
//! nodes.
//!
//! ```text
//!   rtsafe
//!   ├── ChunkPool        - one chunk size, non-blocking allocate/deallocate
//!   ├── PoolMaintainer   - grows/trims a pool from another thread
//!   ├── TieredAllocator  - power-of-two size classes over ChunkPools
//!   └── SysAlloc         - seam to the (blocking) system allocator
//! ```
//!
//! ```rust,no_run
//! use rtsafe::{TieredAllocator, TieredAllocatorConfig};
//!
//! let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(2048)).unwrap();
//! let maintainer = alloc.maintainer().unwrap();
//! let bg = std::thread::spawn(move || {
//!     for _ in 0..100 {
//!         maintainer.sleepy();
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! });
//!
//! // Real-time side: never blocks, may fail.
//! if let Ok(ptr) = alloc.allocate(512) {
//!     // Safety: ptr came from this allocator and is returned exactly once.
//!     unsafe { alloc.deallocate(ptr) };
//! }
//! bg.join().unwrap();
//! ```

pub(crate) mod sync;

pub mod memory;

// pools
pub use memory::chunk_pool::{ChunkPool, ChunkPoolConfig, PoolMaintainer};
pub use memory::tiered::{
    ALLOC_HEADER_SIZE, CLASS_HEADROOM, MIN_CLASS_BUDGET, TieredAllocator, TieredAllocatorConfig,
    TieredMaintainer, class_sizes_for,
};

// system allocator seam
pub use memory::sys::{SysAlloc, SystemAllocator};

// stats/errors
pub use memory::error::{AllocError, PoolError};
pub use memory::stats::PoolStats;
