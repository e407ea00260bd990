use std::alloc::Layout;
use std::ptr::NonNull;

/// Interface to the underlying (possibly blocking) system allocator.
///
/// Only maintenance and teardown call into this trait. The real-time
/// allocate/deallocate paths never do.
pub trait SysAlloc: Send + Sync {
    /// Allocate a block for `layout`. `layout.size()` is never zero.
    /// Returns `None` when the system is out of memory.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// - `ptr` must have been returned by `self.alloc(layout)` with the same `layout`.
    /// - `ptr` must not be used after this call.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The platform allocator: `malloc`/`free` on unix, `std::alloc` elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{Layout, NonNull, SysAlloc, SystemAllocator};

    // malloc only guarantees max_align_t; chunk nodes never ask for more.
    const MALLOC_ALIGN: usize = 2 * std::mem::size_of::<usize>();

    impl SysAlloc for SystemAllocator {
        fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
            debug_assert!(
                layout.align() <= MALLOC_ALIGN,
                "alignment {} exceeds malloc guarantee",
                layout.align()
            );
            // Safety: FFI call to malloc with a non-zero size.
            let ptr = unsafe { libc::malloc(layout.size()) };
            NonNull::new(ptr.cast::<u8>())
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, _layout: Layout) {
            // Safety: ptr came from malloc (caller contract).
            unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        }
    }
}

// Fallback for loom/miri and non-unix targets.
#[cfg(not(all(unix, not(any(loom, miri)))))]
mod fallback {
    use super::{Layout, NonNull, SysAlloc, SystemAllocator};

    impl SysAlloc for SystemAllocator {
        fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
            // Safety: layout has a non-zero size (trait contract).
            NonNull::new(unsafe { std::alloc::alloc(layout) })
        }

        unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
            // Safety: ptr/layout pair came from alloc (caller contract).
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
