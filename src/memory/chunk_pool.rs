use super::error::PoolError;
use super::free_list::{ChunkHeader, ChunkState, FreeList};
use super::stats::{Counter, PoolStats};
use super::sys::{SysAlloc, SystemAllocator};
use std::alloc::Layout;
use std::ptr::NonNull;
use tracing::{debug, warn};

use crate::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Construction parameters for a [`ChunkPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPoolConfig {
    /// Bytes usable by the caller in each chunk.
    pub data_size: usize,
    /// Maintenance grows the available chunk count up to this.
    pub min_preallocated: usize,
    /// Maintenance trims the available chunk count down to this.
    pub max_preallocated: usize,
    /// Enable the staging list and the pool mutex so maintenance can run on
    /// another thread. Without it the pool must stay on one thread.
    pub thread_safe: bool,
}

impl Default for ChunkPoolConfig {
    fn default() -> Self {
        Self {
            data_size: 0,
            min_preallocated: 4,
            max_preallocated: 16,
            thread_safe: true,
        }
    }
}

impl ChunkPoolConfig {
    #[must_use]
    pub fn new(data_size: usize) -> Self {
        Self {
            data_size,
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

/// Staging state. Only ever touched with the pool mutex held.
struct Staging {
    pending: FreeList,
    /// Length of the unused list as last published by the real-time thread.
    observed_unused: usize,
    /// Set once the real-time handle is gone; maintenance becomes a no-op.
    closed: bool,
}

/// State shared between the real-time handle and its maintainers.
struct Shared<A: SysAlloc> {
    data_size: usize,
    min_preallocated: usize,
    max_preallocated: usize,
    layout: Layout,
    allocator: A,
    /// `None` for single-threaded pools.
    staging: Option<Mutex<Staging>>,
    chunks_created: Counter,
    chunks_released: Counter,
}

impl<A: SysAlloc> Shared<A> {
    fn id(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Obtain a fresh node from the system allocator. May block.
    fn new_chunk(&self) -> Option<NonNull<ChunkHeader>> {
        let raw = self.allocator.alloc(self.layout)?;
        self.chunks_created.add(1);
        // Safety: raw is a fresh allocation of `layout`, which covers the header.
        Some(unsafe { ChunkHeader::init(raw, self.id()) })
    }

    /// Hand a node back to the system allocator. May block.
    ///
    /// # Safety
    /// `node` must come from `new_chunk` on this pool and be unlinked.
    unsafe fn release_chunk(&self, node: NonNull<ChunkHeader>) {
        self.chunks_released.add(1);
        // Safety: upheld by caller.
        unsafe { self.allocator.dealloc(node.cast::<u8>(), self.layout) };
    }

    /// Free every node on `list`.
    fn release_all(&self, list: &mut FreeList) {
        while let Some(node) = list.pop() {
            // Safety: node was just unlinked and belongs to this pool.
            unsafe { self.release_chunk(node) };
        }
    }

    fn lock_staging<'a>(staging: &'a Mutex<Staging>) -> MutexGuard<'a, Staging> {
        staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the staging state if the mutex is free right now.
    /// `None` means the lock was contended and the work was skipped.
    fn try_with_staging<R>(&self, f: impl FnOnce(&mut Staging) -> R) -> Option<R> {
        let staging = self.staging.as_ref()?;
        let mut guard = match staging.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(f(&mut guard))
    }

    /// Maintenance for thread-safe pools: move the staging list toward the
    /// preallocation bounds. Blocks on the pool mutex.
    fn sleepy_staged(&self, staging: &Mutex<Staging>) {
        let mut guard = Self::lock_staging(staging);
        let Staging {
            pending,
            observed_unused,
            closed,
        } = &mut *guard;
        if *closed {
            return;
        }

        let mut available = *observed_unused + pending.len();

        while available < self.min_preallocated {
            let Some(node) = self.new_chunk() else {
                warn!(
                    data_size = self.data_size,
                    available,
                    min = self.min_preallocated,
                    "system allocator exhausted, pool stays under-provisioned"
                );
                break;
            };
            // Safety: fresh node, not linked anywhere.
            unsafe { pending.push(node) };
            available += 1;
        }

        while available > self.max_preallocated {
            let Some(node) = pending.pop() else { break };
            // Safety: node was just unlinked from pending.
            unsafe { self.release_chunk(node) };
            available -= 1;
        }
    }
}

impl<A: SysAlloc> Drop for Shared<A> {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            let mut staging = staging.into_inner().unwrap_or_else(PoisonError::into_inner);
            self.release_all(&mut staging.pending);
        }
    }
}

/// A pool of same-sized chunks with a non-blocking allocate/deallocate path.
///
/// `ChunkPool` is the real-time handle. `allocate` and `deallocate` take
/// `&mut self`, never call the system allocator and never block: in
/// thread-safe mode they only *try* the pool mutex to rebalance against the
/// staging list, and skip that step when it is contended.
///
/// Maintenance ([`sleepy`](Self::sleepy), or [`PoolMaintainer::sleepy`] from
/// another thread) is the only operation that allocates or frees system memory.
///
/// ```text
///   real-time thread                      maintenance thread
///   ────────────────                      ──────────────────
///   allocate / deallocate                 sleepy()
///        │   ▲                                 │
///        ▼   │            try_lock             ▼   lock
///   ┌──────────────┐   ◄────────────►   ┌──────────────┐
///   │ unused list  │   refill / spill   │ pending list │ ◄── malloc / free
///   └──────────────┘                    └──────────────┘
/// ```
pub struct ChunkPool<A: SysAlloc = SystemAllocator> {
    shared: Arc<Shared<A>>,
    unused: FreeList,
    used_count: usize,
}

impl ChunkPool<SystemAllocator> {
    /// Create a pool backed by the platform allocator and preallocate up to
    /// `min_preallocated` chunks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the preallocation bounds are inverted or the
    /// chunk size does not form a valid allocation.
    pub fn new(config: ChunkPoolConfig) -> Result<Self, PoolError> {
        Self::with_allocator(config, SystemAllocator)
    }
}

impl<A: SysAlloc> ChunkPool<A> {
    /// Create a pool that draws chunks from `allocator`.
    ///
    /// # Errors
    ///
    /// See [`ChunkPool::new`].
    pub fn with_allocator(config: ChunkPoolConfig, allocator: A) -> Result<Self, PoolError> {
        let ChunkPoolConfig {
            data_size,
            min_preallocated,
            max_preallocated,
            thread_safe,
        } = config;

        if min_preallocated > max_preallocated {
            return Err(PoolError::InvalidPreallocation {
                min: min_preallocated,
                max: max_preallocated,
            });
        }
        let layout =
            ChunkHeader::node_layout(data_size).ok_or(PoolError::ChunkTooLarge { data_size })?;

        let staging = thread_safe.then(|| {
            Mutex::new(Staging {
                pending: FreeList::new(ChunkState::Pending),
                observed_unused: 0,
                closed: false,
            })
        });

        let mut pool = Self {
            shared: Arc::new(Shared {
                data_size,
                min_preallocated,
                max_preallocated,
                layout,
                allocator,
                staging,
                chunks_created: Counter::new(),
                chunks_released: Counter::new(),
            }),
            unused: FreeList::new(ChunkState::Unused),
            used_count: 0,
        };

        pool.sleepy();

        debug!(
            data_size,
            min = min_preallocated,
            max = max_preallocated,
            thread_safe,
            "chunk pool created"
        );
        Ok(pool)
    }

    #[must_use]
    pub fn data_size(&self) -> usize {
        self.shared.data_size
    }

    #[must_use]
    pub fn is_thread_safe(&self) -> bool {
        self.shared.staging.is_some()
    }

    /// Chunks currently owned by application code.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// Chunks ready for allocation without touching the staging list.
    #[must_use]
    pub fn unused_count(&self) -> usize {
        self.unused.len()
    }

    /// Handle for running maintenance from another thread. `None` for pools
    /// created without thread safety.
    #[must_use]
    pub fn maintainer(&self) -> Option<PoolMaintainer<A>> {
        self.shared.staging.as_ref()?;
        Some(PoolMaintainer {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Grow or trim the pool toward its preallocation bounds.
    ///
    /// May call the system allocator and, in thread-safe mode, blocks on the
    /// pool mutex. Never call this from the real-time thread.
    pub fn sleepy(&mut self) {
        let shared = &*self.shared;
        if let Some(staging) = &shared.staging {
            shared.sleepy_staged(staging);
            return;
        }

        while self.unused.len() < shared.min_preallocated {
            let Some(node) = shared.new_chunk() else {
                warn!(
                    data_size = shared.data_size,
                    unused = self.unused.len(),
                    min = shared.min_preallocated,
                    "system allocator exhausted, pool stays under-provisioned"
                );
                return;
            };
            // Safety: fresh node, not linked anywhere.
            unsafe { self.unused.push(node) };
        }

        while self.unused.len() > shared.max_preallocated {
            let Some(node) = self.unused.pop() else { break };
            // Safety: node was just unlinked from unused.
            unsafe { shared.release_chunk(node) };
        }
    }

    /// Pull staged chunks into the unused list, up to the minimum, if the
    /// pool mutex is free. Publishes the resulting unused count.
    #[inline]
    fn try_refill(&mut self) {
        let Self { shared, unused, .. } = self;
        let min = shared.min_preallocated;
        shared.try_with_staging(|staging| {
            let wanted = min.saturating_sub(unused.len());
            staging.pending.transfer(unused, wanted);
            staging.observed_unused = unused.len();
        });
    }

    /// Push unused chunks beyond the maximum onto the staging list, if the
    /// pool mutex is free. Publishes the resulting unused count.
    #[inline]
    fn try_spill(&mut self) {
        let Self { shared, unused, .. } = self;
        let max = shared.max_preallocated;
        shared.try_with_staging(|staging| {
            let surplus = unused.len().saturating_sub(max);
            unused.transfer(&mut staging.pending, surplus);
            staging.observed_unused = unused.len();
        });
    }

    /// Take a chunk from the pool. Non-blocking; safe on the real-time thread.
    ///
    /// Returns `None` when no chunk is ready. This never falls back to the
    /// system allocator.
    #[must_use]
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        if self.unused.is_empty() {
            self.try_refill();
        }
        let node = self.unused.pop()?;
        // Safety: node was just unlinked from unused.
        unsafe { ChunkHeader::set_state(node, ChunkState::InUse) };
        self.used_count += 1;

        self.try_refill();

        Some(ChunkHeader::data(node))
    }

    /// Return a chunk to the pool. Non-blocking; safe on the real-time thread.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this exact pool.
    /// - `ptr` must not have been deallocated already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Safety: upheld by caller.
        let node = unsafe { ChunkHeader::from_data(ptr) };

        // Safety: a pointer from allocate on this pool has an initialized header.
        let (owner, state) = unsafe { (ChunkHeader::owner(node), ChunkHeader::state(node)) };
        if owner != self.shared.id() {
            debug_assert!(false, "Pointer {ptr:p} does not belong to this ChunkPool");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() };
        }
        if state != ChunkState::InUse {
            debug_assert!(false, "Double free detected in ChunkPool for pointer {ptr:p}");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() };
        }

        // Safety: node is in use and owned by this pool, so it is unlinked.
        unsafe { self.unused.push(node) };
        self.used_count -= 1;

        self.try_spill();
    }

    /// Allocate, running maintenance until a chunk is available.
    ///
    /// Blocking convenience for warm-up and other non-real-time call sites.
    /// Spins for as long as the system allocator keeps failing.
    pub fn allocate_sleepy(&mut self) -> NonNull<u8> {
        loop {
            self.sleepy();
            if let Some(ptr) = self.allocate() {
                return ptr;
            }
            // With min_preallocated == 0 maintenance never grows, and with
            // max_preallocated == 0 it trims anything left on the unused list.
            // Hand a directly grown chunk straight to the caller.
            match self.shared.new_chunk() {
                Some(node) => {
                    self.used_count += 1;
                    return ChunkHeader::data(node);
                }
                None => crate::sync::thread::yield_now(),
            }
        }
    }

    /// Snapshot of the pool's counters. Takes the pool mutex (blocking) to
    /// read the staging list; not for the real-time thread.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let pending = self
            .shared
            .staging
            .as_ref()
            .map_or(0, |staging| Shared::<A>::lock_staging(staging).pending.len());
        PoolStats {
            data_size: self.shared.data_size,
            used: self.used_count,
            unused: self.unused.len(),
            pending,
            chunks_created: self.shared.chunks_created.get(),
            chunks_released: self.shared.chunks_released.get(),
        }
    }
}

impl<A: SysAlloc> Drop for ChunkPool<A> {
    fn drop(&mut self) {
        // Caller must return every chunk before dropping the pool. In release
        // builds outstanding chunks are leaked rather than freed under the caller.
        debug_assert!(
            self.used_count == 0 || std::thread::panicking(),
            "ChunkPool dropped with {} chunks still in use",
            self.used_count
        );
        self.shared.release_all(&mut self.unused);
        if let Some(staging) = &self.shared.staging {
            let mut staging = Shared::<A>::lock_staging(staging);
            staging.closed = true;
            self.shared.release_all(&mut staging.pending);
        }
        debug!(data_size = self.shared.data_size, "chunk pool destroyed");
    }
}

/// Cloneable maintenance handle for a thread-safe [`ChunkPool`].
///
/// Only touches the staging list, under the pool mutex, so it can run on any
/// thread concurrently with the real-time owner of the pool.
pub struct PoolMaintainer<A: SysAlloc = SystemAllocator> {
    shared: Arc<Shared<A>>,
}

impl<A: SysAlloc> Clone for PoolMaintainer<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A: SysAlloc> PoolMaintainer<A> {
    /// See [`ChunkPool::sleepy`]. Blocks on the pool mutex.
    pub fn sleepy(&self) {
        if let Some(staging) = &self.shared.staging {
            self.shared.sleepy_staged(staging);
        }
    }

    #[must_use]
    pub fn data_size(&self) -> usize {
        self.shared.data_size
    }
}
