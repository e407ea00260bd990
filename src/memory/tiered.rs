use super::chunk_pool::{ChunkPool, ChunkPoolConfig, PoolMaintainer};
use super::error::{AllocError, PoolError};
use super::stats::PoolStats;
use super::sys::{SysAlloc, SystemAllocator};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Byte budget of the smallest size class. Each further class doubles it.
pub const MIN_CLASS_BUDGET: usize = 1024;

/// Bytes subtracted from every class budget, so a chunk plus the system
/// allocator's own bookkeeping stays within the budget instead of spilling
/// into an extra page.
pub const CLASS_HEADROOM: usize = 100;

/// Bytes stored in front of every allocation to route it back to its pool.
pub const ALLOC_HEADER_SIZE: usize = std::mem::size_of::<usize>();

/// Construction parameters for a [`TieredAllocator`]. The preallocation
/// bounds apply to every size class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TieredAllocatorConfig {
    /// Largest request the allocator must satisfy.
    pub max_size: usize,
    pub min_preallocated: usize,
    pub max_preallocated: usize,
    pub thread_safe: bool,
}

impl Default for TieredAllocatorConfig {
    fn default() -> Self {
        Self {
            max_size: 4096,
            min_preallocated: 4,
            max_preallocated: 16,
            thread_safe: true,
        }
    }
}

impl TieredAllocatorConfig {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn preallocated(mut self, min: usize, max: usize) -> Self {
        self.min_preallocated = min;
        self.max_preallocated = max;
        self
    }

    #[must_use]
    pub fn thread_safe(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }
}

/// Chunk sizes for a doubling progression that covers `max_size` bytes of
/// caller data plus the allocation header.
///
/// Class `i` has a budget of `MIN_CLASS_BUDGET << i` and a chunk size of
/// budget minus `CLASS_HEADROOM`.
///
/// # Errors
///
/// Returns `PoolError::SizeClassOverflow` if covering `max_size` would need
/// more classes than `usize::BITS` or overflow `usize`.
pub fn class_sizes_for(max_size: usize) -> Result<Vec<usize>, PoolError> {
    let overflow = PoolError::SizeClassOverflow { max_size };
    let needed = max_size
        .checked_add(ALLOC_HEADER_SIZE + CLASS_HEADROOM)
        .ok_or(overflow)?;

    let mut budget = MIN_CLASS_BUDGET;
    let mut sizes = vec![budget - CLASS_HEADROOM];
    while budget < needed {
        if sizes.len() >= usize::BITS as usize {
            // A caller genuinely needing this is vanishingly unlikely; treat
            // it as a misconfigured maximum.
            return Err(overflow);
        }
        budget = budget.checked_mul(2).ok_or(overflow)?;
        sizes.push(budget - CLASS_HEADROOM);
    }
    Ok(sizes)
}

struct SizeClass<A: SysAlloc> {
    /// Chunk size of `pool`, header included.
    size: usize,
    pool: ChunkPool<A>,
}

/// Multi-size real-time allocator built from [`ChunkPool`]s whose chunk sizes
/// double from [`MIN_CLASS_BUDGET`].
///
/// A request goes to the smallest class whose chunk fits the request plus an
/// [`ALLOC_HEADER_SIZE`] header. The header holds the class index, so
/// [`deallocate`](Self::deallocate) needs only the pointer.
///
/// ```text
///   chunk from class i
///   ┌───────────────┬──────────────────────────────────────┐
///   │ class index i │ caller data (<= chunk size - header) │
///   └───────────────┴──────────────────────────────────────┘
///                   ▲
///                   └── pointer returned by allocate()
/// ```
///
/// Like [`ChunkPool`], `allocate` and `deallocate` never block or touch the
/// system allocator; [`sleepy`](Self::sleepy) (or a [`TieredMaintainer`] on
/// another thread) does all growing and trimming.
pub struct TieredAllocator<A: SysAlloc + Clone = SystemAllocator> {
    classes: Vec<SizeClass<A>>,
    max_size: usize,
}

impl TieredAllocator<SystemAllocator> {
    /// # Errors
    ///
    /// Returns `PoolError` if the size progression overflows or any pool
    /// fails to construct. Pools built before the failure are torn down.
    pub fn new(config: TieredAllocatorConfig) -> Result<Self, PoolError> {
        Self::with_allocator(config, SystemAllocator)
    }
}

impl<A: SysAlloc + Clone> TieredAllocator<A> {
    /// # Errors
    ///
    /// See [`TieredAllocator::new`].
    pub fn with_allocator(config: TieredAllocatorConfig, allocator: A) -> Result<Self, PoolError> {
        debug!(max_size = config.max_size, "tiered allocator init");

        let sizes = class_sizes_for(config.max_size)?;
        let mut classes = Vec::with_capacity(sizes.len());
        for size in sizes {
            let pool_config = ChunkPoolConfig {
                data_size: size,
                min_preallocated: config.min_preallocated,
                max_preallocated: config.max_preallocated,
                thread_safe: config.thread_safe,
            };
            // On error, pools already in `classes` drop here and release their chunks.
            let pool = ChunkPool::with_allocator(pool_config, allocator.clone())?;
            classes.push(SizeClass { size, pool });
        }

        debug!(
            classes = classes.len(),
            largest = classes.last().map_or(0, |c| c.size),
            "tiered allocator ready"
        );
        Ok(Self {
            classes,
            max_size: config.max_size,
        })
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Chunk size of every class, ascending.
    pub fn class_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.classes.iter().map(|c| c.size)
    }

    /// Index of the class that would serve a request of `size` bytes.
    #[must_use]
    pub fn class_for(&self, size: usize) -> Option<usize> {
        if size > self.max_size {
            return None;
        }
        let needed = size + ALLOC_HEADER_SIZE;
        self.classes.iter().position(|c| needed <= c.size)
    }

    /// Allocate `size` bytes. Non-blocking; safe on the real-time thread.
    ///
    /// The returned pointer is aligned to `align_of::<usize>()`.
    ///
    /// # Errors
    ///
    /// - `AllocError::Oversized` if `size` exceeds the configured maximum.
    /// - `AllocError::Exhausted` if the matching class has no chunk ready.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(index) = self.class_for(size) else {
            warn!(requested = size, max_size = self.max_size, "data size is too big");
            return Err(AllocError::Oversized {
                requested: size,
                max_size: self.max_size,
            });
        };

        let class = &mut self.classes[index];
        let chunk = class.pool.allocate().ok_or(AllocError::Exhausted {
            chunk_size: class.size,
        })?;

        // Safety: chunk is pointer-aligned and at least ALLOC_HEADER_SIZE + size bytes long.
        unsafe {
            chunk.cast::<usize>().write(index);
            Ok(chunk.add(ALLOC_HEADER_SIZE))
        }
    }

    /// Return memory obtained from [`allocate`](Self::allocate). Non-blocking;
    /// safe on the real-time thread.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this exact allocator.
    /// - `ptr` must not have been deallocated already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Safety: upheld by caller; the header precedes the data.
        let chunk = unsafe { ptr.sub(ALLOC_HEADER_SIZE) };
        // Safety: the header was written by allocate.
        let index = unsafe { chunk.cast::<usize>().read() };

        if index >= self.classes.len() {
            debug_assert!(false, "Corrupt allocation header for pointer {ptr:p}: class {index}");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() };
        }

        // Safety: chunk came from this class's pool (caller contract + header).
        unsafe { self.classes[index].pool.deallocate(chunk) };
    }

    /// Allocate `size` bytes, running maintenance until the class has a chunk.
    /// For non-real-time call sites only.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::Oversized` if `size` exceeds the configured maximum.
    pub fn allocate_sleepy(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(index) = self.class_for(size) else {
            warn!(requested = size, max_size = self.max_size, "data size is too big");
            return Err(AllocError::Oversized {
                requested: size,
                max_size: self.max_size,
            });
        };
        let chunk = self.classes[index].pool.allocate_sleepy();
        // Safety: see allocate.
        unsafe {
            chunk.cast::<usize>().write(index);
            Ok(chunk.add(ALLOC_HEADER_SIZE))
        }
    }

    /// Run maintenance on every class, smallest first. Blocking; never call
    /// this from the real-time thread.
    pub fn sleepy(&mut self) {
        for class in &mut self.classes {
            class.pool.sleepy();
        }
    }

    /// Handle for running maintenance from another thread. `None` when the
    /// allocator was built without thread safety.
    #[must_use]
    pub fn maintainer(&self) -> Option<TieredMaintainer<A>> {
        let pools = self
            .classes
            .iter()
            .map(|c| c.pool.maintainer())
            .collect::<Option<Vec<_>>>()?;
        Some(TieredMaintainer { pools })
    }

    /// Per-class snapshots, smallest class first. Takes each pool mutex.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.classes.iter().map(|c| c.pool.stats()).collect()
    }
}

impl<A: SysAlloc + Clone> Drop for TieredAllocator<A> {
    fn drop(&mut self) {
        debug!("tiered allocator uninit");
        for class in self.classes.drain(..) {
            debug!(size = class.size, "destroying pool");
            drop(class);
        }
    }
}

/// Cloneable maintenance handle for a thread-safe [`TieredAllocator`].
pub struct TieredMaintainer<A: SysAlloc = SystemAllocator> {
    pools: Vec<PoolMaintainer<A>>,
}

impl<A: SysAlloc> Clone for TieredMaintainer<A> {
    fn clone(&self) -> Self {
        Self {
            pools: self.pools.clone(),
        }
    }
}

impl<A: SysAlloc> TieredMaintainer<A> {
    /// See [`TieredAllocator::sleepy`].
    pub fn sleepy(&self) {
        for pool in &self.pools {
            pool.sleepy();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::sys::counting::CountingAllocator;

    #[test]
    fn test_class_sizes_small_max() {
        // 1 + 8 + 100 fits the first budget.
        assert_eq!(class_sizes_for(1).unwrap(), vec![924]);
        assert_eq!(class_sizes_for(924 - ALLOC_HEADER_SIZE).unwrap(), vec![924]);
        assert_eq!(class_sizes_for(925 - ALLOC_HEADER_SIZE).unwrap(), vec![924, 1948]);
    }

    #[test]
    fn test_class_sizes_cover_max() {
        for max in [0, 100, 1000, 2048, 4096, 10_000, 1 << 20] {
            let sizes = class_sizes_for(max).unwrap();
            assert!(*sizes.last().unwrap() >= max + ALLOC_HEADER_SIZE, "max {max}: {sizes:?}");
            if sizes.len() > 1 {
                assert!(sizes[sizes.len() - 2] < max + ALLOC_HEADER_SIZE, "max {max}: {sizes:?}");
            }
            for pair in sizes.windows(2) {
                assert_eq!(pair[1] + CLASS_HEADROOM, 2 * (pair[0] + CLASS_HEADROOM));
            }
        }
        assert_eq!(class_sizes_for(4096).unwrap(), vec![924, 1948, 3996, 8092]);
    }

    #[test]
    fn test_class_sizes_overflow() {
        assert_eq!(
            class_sizes_for(usize::MAX).err(),
            Some(PoolError::SizeClassOverflow { max_size: usize::MAX })
        );
        assert_eq!(
            class_sizes_for(usize::MAX / 2 + 1).err(),
            Some(PoolError::SizeClassOverflow { max_size: usize::MAX / 2 + 1 })
        );
    }

    #[test]
    fn test_tiered_routes_to_smallest_class() {
        let alloc = TieredAllocator::new(TieredAllocatorConfig::new(4096).preallocated(2, 4)).unwrap();
        assert_eq!(alloc.class_for(0), Some(0));
        assert_eq!(alloc.class_for(916), Some(0));
        assert_eq!(alloc.class_for(917), Some(1));
        assert_eq!(alloc.class_for(1940), Some(1));
        assert_eq!(alloc.class_for(1941), Some(2));
        assert_eq!(alloc.class_for(4096), Some(3));
        assert_eq!(alloc.class_for(4097), None);
    }

    #[test]
    fn test_tiered_exact_max_size_succeeds() {
        for max in [1000, 2048, 4096, 5000] {
            let mut alloc =
                TieredAllocator::new(TieredAllocatorConfig::new(max).preallocated(1, 2)).unwrap();
            let p = alloc.allocate(max).expect("max_size must always fit");
            // Safety: Test code.
            unsafe {
                std::ptr::write_bytes(p.as_ptr(), 0x7E, max);
                alloc.deallocate(p);
            }
        }
    }

    #[test]
    fn test_tiered_oversized_request() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(4096).preallocated(1, 2)).unwrap();
        assert_eq!(
            alloc.allocate(5000),
            Err(AllocError::Oversized { requested: 5000, max_size: 4096 })
        );
        assert_eq!(
            alloc.allocate_sleepy(5000),
            Err(AllocError::Oversized { requested: 5000, max_size: 4096 })
        );
        assert!(alloc.pool_stats().iter().all(|s| s.used == 0));
    }

    #[test]
    fn test_tiered_exhausted_class() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(2048).preallocated(2, 2)).unwrap();
        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(20).unwrap();
        assert_eq!(alloc.allocate(30), Err(AllocError::Exhausted { chunk_size: 924 }));
        // Other classes are unaffected.
        let c = alloc.allocate(1500).unwrap();
        // Safety: Test code.
        unsafe {
            alloc.deallocate(a);
            alloc.deallocate(b);
            alloc.deallocate(c);
        }
    }

    #[test]
    fn test_tiered_deallocate_routes_back() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(2048).preallocated(4, 8)).unwrap();
        let sizes = [50, 500, 1500, 2048, 916, 917];
        let ptrs: Vec<_> = sizes.iter().map(|&s| (s, alloc.allocate(s).unwrap())).collect();

        let used: Vec<_> = alloc.pool_stats().iter().map(|s| s.used).collect();
        assert_eq!(used, vec![3, 2, 1]);

        for (size, p) in &ptrs {
            assert_eq!(p.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0xEE, *size) };
        }
        for (_, p) in ptrs {
            // Safety: Test code.
            unsafe { alloc.deallocate(p) };
        }
        assert!(alloc.pool_stats().iter().all(|s| s.used == 0));
    }

    #[test]
    fn test_tiered_roundtrip_same_slot() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(4096).preallocated(2, 4)).unwrap();
        let p = alloc.allocate(700).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(p) };
        let q = alloc.allocate(700).unwrap();
        assert_eq!(p, q);
        // Safety: Test code.
        unsafe { alloc.deallocate(q) };
    }

    #[test]
    fn test_tiered_sleepy_refills_every_class() {
        let counting = CountingAllocator::new();
        let mut alloc = TieredAllocator::with_allocator(
            TieredAllocatorConfig::new(4096).preallocated(1, 3).thread_safe(false),
            counting.clone(),
        )
        .unwrap();
        assert_eq!(counting.allocs(), 4);

        let ptrs: Vec<_> = [10, 1000, 3000, 4000]
            .iter()
            .map(|&s| alloc.allocate(s).unwrap())
            .collect();
        assert!(alloc.pool_stats().iter().all(|s| s.unused == 0));

        alloc.sleepy();
        assert!(alloc.pool_stats().iter().all(|s| s.unused == 1));
        assert_eq!(counting.allocs(), 8);

        for p in ptrs {
            // Safety: Test code.
            unsafe { alloc.deallocate(p) };
        }
        drop(alloc);
        assert_eq!(counting.allocs(), counting.deallocs());
    }

    #[test]
    fn test_tiered_allocate_sleepy_blocks_until_available() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(1024).preallocated(0, 1)).unwrap();
        assert!(matches!(alloc.allocate(64), Err(AllocError::Exhausted { .. })));
        let p = alloc.allocate_sleepy(64).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(p) };
    }

    #[test]
    fn test_tiered_allocate_sleepy_with_zero_bounds() {
        let counting = CountingAllocator::new();
        let mut alloc = TieredAllocator::with_allocator(
            TieredAllocatorConfig::new(2048).preallocated(0, 0).thread_safe(false),
            counting.clone(),
        )
        .unwrap();
        assert_eq!(counting.allocs(), 0);
        let p = alloc.allocate_sleepy(1500).unwrap();
        assert_eq!(alloc.pool_stats()[1].used, 1);
        // Safety: Test code.
        unsafe { alloc.deallocate(p) };
        alloc.sleepy();
        drop(alloc);
        assert_eq!(counting.allocs(), counting.deallocs());
    }

    #[test]
    fn test_tiered_maintainer_only_when_thread_safe() {
        let ts = TieredAllocator::new(TieredAllocatorConfig::new(1024)).unwrap();
        assert!(ts.maintainer().is_some());
        let st = TieredAllocator::new(TieredAllocatorConfig::new(1024).thread_safe(false)).unwrap();
        assert!(st.maintainer().is_none());
    }

    #[test]
    fn test_tiered_invalid_bounds_rejected() {
        let counting = CountingAllocator::new();
        let err = TieredAllocator::with_allocator(
            TieredAllocatorConfig::new(4096).preallocated(5, 1),
            counting.clone(),
        )
        .err();
        assert_eq!(err, Some(PoolError::InvalidPreallocation { min: 5, max: 1 }));
        assert_eq!(counting.allocs(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Corrupt allocation header")]
    fn test_tiered_corrupt_header() {
        let mut alloc = TieredAllocator::new(TieredAllocatorConfig::new(1024).preallocated(1, 2)).unwrap();
        let p = alloc.allocate(16).unwrap();
        // Safety: Test code.
        unsafe {
            p.sub(ALLOC_HEADER_SIZE).cast::<usize>().write(99);
            alloc.deallocate(p);
        }
    }
}
