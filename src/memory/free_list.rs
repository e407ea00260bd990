use std::alloc::Layout;
use std::ptr::NonNull;

/// Which collection currently owns a chunk.
///
/// A chunk is in exactly one of these states at any time. The tag lives in
/// the chunk header and is what the debug-build double-free check reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChunkState {
    /// On the real-time free-list.
    Unused,
    /// On the staging free-list (thread-safe pools only).
    Pending,
    /// Owned by application code.
    InUse,
}

/// Node header placed in front of every chunk's data region.
///
/// ```text
///   ┌──────────────────────────┬──────────────────────────────┐
///   │ ChunkHeader              │ data (data_size bytes)       │
///   │  next / state / owner    │                              │
///   └──────────────────────────┴──────────────────────────────┘
///                              ▲
///                              └── pointer handed to the caller
/// ```
#[repr(C)]
pub(crate) struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    /// Address of the owning pool's shared state.
    owner: usize,
    state: ChunkState,
}

/// Bytes between a node's start and its data region. A multiple of the
/// header alignment, so the data region is pointer-aligned.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

const _: () = assert!(HEADER_SIZE.is_multiple_of(std::mem::align_of::<ChunkHeader>()));

impl ChunkHeader {
    /// Layout of a whole node (header + data) for the given data size.
    pub(crate) fn node_layout(data_size: usize) -> Option<Layout> {
        let size = HEADER_SIZE.checked_add(data_size)?;
        Layout::from_size_align(size, std::mem::align_of::<ChunkHeader>()).ok()
    }

    /// Initialize a freshly allocated node in place.
    ///
    /// # Safety
    /// `raw` must point to writable memory of at least `HEADER_SIZE` bytes,
    /// aligned for `ChunkHeader`.
    pub(crate) unsafe fn init(raw: NonNull<u8>, owner: usize) -> NonNull<ChunkHeader> {
        let node = raw.cast::<ChunkHeader>();
        // Safety: upheld by caller.
        unsafe {
            node.as_ptr().write(ChunkHeader {
                next: None,
                owner,
                state: ChunkState::InUse,
            });
        }
        node
    }

    /// Data region that follows the header.
    pub(crate) fn data(node: NonNull<ChunkHeader>) -> NonNull<u8> {
        // Safety: every node is allocated with room for the header plus data.
        unsafe { node.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Recover the node from a data pointer.
    ///
    /// # Safety
    /// `data` must have been produced by [`ChunkHeader::data`].
    pub(crate) unsafe fn from_data(data: NonNull<u8>) -> NonNull<ChunkHeader> {
        // Safety: upheld by caller.
        unsafe { data.sub(HEADER_SIZE).cast::<ChunkHeader>() }
    }

    /// # Safety
    /// `node` must point to an initialized header.
    pub(crate) unsafe fn state(node: NonNull<ChunkHeader>) -> ChunkState {
        // Safety: upheld by caller.
        unsafe { (*node.as_ptr()).state }
    }

    /// # Safety
    /// `node` must point to an initialized header that nobody else is mutating.
    pub(crate) unsafe fn set_state(node: NonNull<ChunkHeader>, state: ChunkState) {
        // Safety: upheld by caller.
        unsafe { (*node.as_ptr()).state = state };
    }

    /// # Safety
    /// `node` must point to an initialized header.
    pub(crate) unsafe fn owner(node: NonNull<ChunkHeader>) -> usize {
        // Safety: upheld by caller.
        unsafe { (*node.as_ptr()).owner }
    }
}

/// Intrusive LIFO list of chunk nodes. Push and pop are O(1) and never
/// allocate. Every node pushed takes the list's state tag.
pub(crate) struct FreeList {
    head: Option<NonNull<ChunkHeader>>,
    len: usize,
    state: ChunkState,
}

// Safety: the list exclusively owns the nodes linked into it.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new(state: ChunkState) -> Self {
        debug_assert!(!matches!(state, ChunkState::InUse));
        Self {
            head: None,
            len: 0,
            state,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `node` at the head of the list.
    ///
    /// # Safety
    /// - `node` must point to an initialized header.
    /// - `node` must not currently be linked into any list.
    #[inline]
    pub(crate) unsafe fn push(&mut self, node: NonNull<ChunkHeader>) {
        // Safety: upheld by caller; the node is exclusively ours now.
        unsafe {
            let header = &mut *node.as_ptr();
            header.next = self.head;
            header.state = self.state;
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// Unlink the head node. Its state tag still reads as this list's state;
    /// the caller retags it when handing it on.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<ChunkHeader>> {
        let node = self.head?;
        // Safety: every linked node is initialized and owned by this list.
        unsafe {
            let header = &mut *node.as_ptr();
            self.head = header.next.take();
        }
        self.len -= 1;
        Some(node)
    }

    /// Move up to `count` nodes from `self` onto `other`. Returns the number moved.
    pub(crate) fn transfer(&mut self, other: &mut FreeList, count: usize) -> usize {
        let mut moved = 0;
        while moved < count {
            let Some(node) = self.pop() else { break };
            // Safety: node was just unlinked from self.
            unsafe { other.push(node) };
            moved += 1;
        }
        moved
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        // Lists are drained by their pool; a non-empty list here would leak.
        debug_assert!(
            self.is_empty() || std::thread::panicking(),
            "FreeList dropped with {} linked chunks",
            self.len
        );
    }
}
