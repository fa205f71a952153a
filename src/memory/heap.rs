use super::block::{
    ALIGN, BLOCK_OVERHEAD, BlockHeader, FREE_TAG, MIN_PAYLOAD, MIN_SPLIT, USED_TAG,
};
use super::free_list::FreeList;
use super::region::{DEFAULT_INITIAL, DEFAULT_RESERVED, Region};
use super::vm::VmError;
use log::debug;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

#[derive(Debug)]
pub enum HeapError {
    /// Neither the free list nor heap growth could satisfy an allocation.
    /// Fatal to the triggering call only: the heap stays valid and later
    /// calls may succeed again (e.g. after an intervening free).
    OutOfMemory { requested: usize },
    /// Rejected `HeapConfig` values.
    InvalidConfig(String),
    /// The OS memory-mapping collaborator failed.
    Vm(VmError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            HeapError::InvalidConfig(msg) => write!(f, "invalid heap config: {msg}"),
            HeapError::Vm(e) => write!(f, "heap VM operation failed: {e}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::Vm(e) => Some(e),
            HeapError::OutOfMemory { .. } | HeapError::InvalidConfig(_) => None,
        }
    }
}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        HeapError::Vm(e)
    }
}

/// Configuration for [`Heap`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Address-space ceiling for one heap. Reserved up front so growth is
    /// always contiguous; physical pages are committed lazily.
    /// Default: 1 GiB.
    pub reserved_limit: usize,

    /// Initially committed heap span. Rounded up to 64 KiB.
    /// Default: 64 KiB.
    pub initial_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            reserved_limit: DEFAULT_RESERVED,
            initial_size: DEFAULT_INITIAL,
        }
    }
}

/// Point-in-time snapshot of one heap's gauges.
///
/// `allocated_bytes` and `free_bytes` count payload capacity only;
/// `overhead_bytes` covers all block metadata, so
/// `allocated + free + overhead == heap_end - heap_start` exactly.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub overhead_bytes: usize,
    pub committed_bytes: usize,
    pub reserved_bytes: usize,
}

/// A first-fit, boundary-tagged free-list allocator over one contiguous
/// OS-backed region.
///
/// Blocks exactly tile `[heap_start, heap_end)`: each one is a 32-byte header,
/// a payload whose capacity is a multiple of 8, and an 8-byte boundary-tag
/// footer. Free blocks are threaded through an intrusive doubly-linked list;
/// adjacent free blocks are merged eagerly on every free, so at most one
/// neighbor on each side of any block can be free.
///
/// The heap itself is single-threaded: callers needing shared access must
/// serialize externally (see [`GlobalHeap`] for the mutex-guarded
/// process-wide instance).
#[derive(Debug)]
pub struct Heap {
    region: Region,
    free_list: FreeList,
    allocated_bytes: usize,
    free_bytes: usize,
    block_count: usize,
}

// Safety: Heap owns its region and all block memory within it; the raw
// free-list pointers never escape the instance.
unsafe impl Send for Heap {}

impl Heap {
    /// Create a heap with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `HeapError` if the OS mapping request fails.
    pub fn new() -> Result<Self, HeapError> {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with an explicit configuration.
    ///
    /// # Errors
    ///
    /// `HeapError::InvalidConfig` for inconsistent sizes, or a VM error if
    /// the OS mapping request fails.
    pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
        if config.initial_size == 0 {
            return Err(HeapError::InvalidConfig(
                "initial_size must be non-zero".to_string(),
            ));
        }
        if config.initial_size > config.reserved_limit {
            return Err(HeapError::InvalidConfig(format!(
                "initial_size ({}) exceeds reserved_limit ({})",
                config.initial_size, config.reserved_limit
            )));
        }

        let region = Region::new(config.reserved_limit, config.initial_size)?;
        let mut heap = Self {
            region,
            free_list: FreeList::new(),
            allocated_bytes: 0,
            free_bytes: 0,
            block_count: 0,
        };
        // Safety: the freshly committed span is owned and holds no blocks yet.
        unsafe { heap.install_free_span(heap.region.start(), heap.region.committed_bytes()) };
        debug!(
            "heap initialized: {} bytes committed, {} reserved",
            heap.region.committed_bytes(),
            heap.region.reserved_bytes()
        );
        Ok(heap)
    }

    /// Allocate `size` bytes. The returned pointer is always 8-byte aligned
    /// and points at at least `size` writable bytes.
    ///
    /// A zero-size request yields a distinct minimal block (8 bytes of
    /// capacity): the pointer is non-null, safely freeable, and never
    /// corrupts allocator state.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` when neither the free list nor growth can
    /// satisfy the request. The heap stays valid; later calls may succeed.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let need = size
            .max(MIN_PAYLOAD)
            .checked_next_multiple_of(ALIGN)
            .ok_or(HeapError::OutOfMemory { requested: size })?;

        // Safety: the free list links only valid FREE headers in this heap.
        if let Some(block) = unsafe { self.free_list.find_fit(need) } {
            // Safety: block came from our free list with size >= need.
            return Ok(unsafe { self.place(block, need) });
        }

        // First-fit failed: extend the heap and retry exactly once. The grown
        // span merges with a trailing free block, so the retry cannot miss.
        let min_grow = need
            .checked_add(BLOCK_OVERHEAD)
            .ok_or(HeapError::OutOfMemory { requested: size })?;
        let old_end = self.region.end();
        let added = self.region.grow(min_grow)?;
        // Safety: [old_end, old_end + added) is freshly committed and unused.
        unsafe { self.install_free_span(old_end, added) };

        // Safety: as above.
        match unsafe { self.free_list.find_fit(need) } {
            // Safety: block came from our free list with size >= need.
            Some(block) => Ok(unsafe { self.place(block, need) }),
            None => {
                debug_assert!(false, "grown span of {added} bytes cannot satisfy {need}");
                Err(HeapError::OutOfMemory { requested: size })
            }
        }
    }

    /// Return a payload pointer to the allocator.
    ///
    /// Null is a no-op. The header's state tag is verified on every call: an
    /// invalid or repeated free panics loudly instead of corrupting the free
    /// list. The freed block is merged with any free physical neighbor on
    /// either side before rejoining the free list.
    ///
    /// # Safety
    /// A non-null `ptr` must have been returned by [`alloc`](Self::alloc) on
    /// this heap and not freed since.
    ///
    /// # Panics
    ///
    /// Panics when the header tag does not mark a live block (double free or
    /// foreign pointer).
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        // Safety: contract upheld by caller.
        let block = unsafe { BlockHeader::from_payload(payload) };
        // Safety: the header is readable memory inside our heap.
        unsafe { BlockHeader::check_live(block, ptr) };

        // Safety: block is a verified live header we own.
        let size = unsafe { (*block.as_ptr()).size };
        self.allocated_bytes -= size;
        self.free_bytes += size;
        // Safety: as above; mark free before coalescing.
        unsafe { (*block.as_ptr()).tag = FREE_TAG };

        // Coalesce forward, then backward. A single pass suffices: eager
        // merging guarantees at most one free neighbor on each side.
        // Safety: block is a valid FREE header inside the heap.
        unsafe {
            self.merge_with_next(block);
            let block = self.merge_with_prev(block);
            BlockHeader::write_footer(block);
            self.free_list.insert(block);
        }
    }

    /// Sum of payload capacity over USED blocks.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Sum of payload capacity over FREE blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Total block metadata bytes (header + footer per block).
    #[must_use]
    pub fn overhead_bytes(&self) -> usize {
        self.block_count * BLOCK_OVERHEAD
    }

    /// Base of the managed range. Fixed for the heap's lifetime.
    #[must_use]
    pub fn heap_start(&self) -> *const u8 {
        self.region.start() as *const u8
    }

    /// Exclusive upper bound of the managed range. Advances monotonically as
    /// the heap grows.
    #[must_use]
    pub fn heap_end(&self) -> *const u8 {
        self.region.end() as *const u8
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated_bytes: self.allocated_bytes,
            free_bytes: self.free_bytes,
            overhead_bytes: self.overhead_bytes(),
            committed_bytes: self.region.committed_bytes(),
            reserved_bytes: self.region.reserved_bytes(),
        }
    }

    /// Carve `[at, at + len)` into one FREE block, merging it with a FREE
    /// block ending exactly at `at` if one exists, and link the result.
    ///
    /// # Safety
    /// The span must be committed memory directly following the existing
    /// blocks (or the very start of the heap), not overlapping any block.
    unsafe fn install_free_span(&mut self, at: usize, len: usize) {
        debug_assert!(len >= BLOCK_OVERHEAD + MIN_PAYLOAD);
        debug_assert!(at.is_multiple_of(ALIGN));
        // Safety: span validity upheld by caller.
        let block = unsafe {
            BlockHeader::init_free(NonNull::new_unchecked(at as *mut u8), len - BLOCK_OVERHEAD)
        };
        self.block_count += 1;
        self.free_bytes += len - BLOCK_OVERHEAD;

        // Safety: block is a valid FREE header; merge absorbs a free
        // predecessor so growth extends the trailing free block seamlessly.
        unsafe {
            let merged = self.merge_with_prev(block);
            BlockHeader::write_footer(merged);
            self.free_list.insert(merged);
        }
    }

    /// If the block physically following `block` is FREE, unlink and absorb
    /// it; the absorbed header and footer become payload.
    ///
    /// # Safety
    /// `block` must be a valid header inside the heap, not linked in the
    /// free list.
    unsafe fn merge_with_next(&mut self, block: NonNull<BlockHeader>) {
        // Safety: upheld by caller.
        let Some(next) = (unsafe { BlockHeader::next_neighbor(block, self.region.end()) }) else {
            return;
        };
        // Safety: next is a valid header; its tag tells its state.
        if unsafe { (*next.as_ptr()).tag } != FREE_TAG {
            return;
        }
        // Safety: a FREE tag means next is linked in the free list.
        unsafe {
            self.free_list.remove(next);
            (*block.as_ptr()).size += BLOCK_OVERHEAD + (*next.as_ptr()).size;
        }
        self.free_bytes += BLOCK_OVERHEAD;
        self.block_count -= 1;
    }

    /// If the block physically preceding `block` is FREE, unlink it, absorb
    /// `block` into it, and return the enlarged predecessor; otherwise return
    /// `block` unchanged. The caller must rewrite the footer afterwards.
    ///
    /// # Safety
    /// `block` must be a valid header inside the heap, not linked in the
    /// free list.
    unsafe fn merge_with_prev(&mut self, block: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let addr = block.as_ptr() as usize;
        if addr == self.region.start() {
            return block;
        }
        // Safety: not the first block, so a boundary tag ends right before it.
        let (prev, prev_free) = unsafe { BlockHeader::prev_neighbor(addr) };
        if !prev_free {
            return block;
        }
        // Safety: the footer's free bit proves prev is a linked FREE block.
        unsafe {
            self.free_list.remove(prev);
            (*prev.as_ptr()).size += BLOCK_OVERHEAD + (*block.as_ptr()).size;
        }
        self.free_bytes += BLOCK_OVERHEAD;
        self.block_count -= 1;
        prev
    }

    /// Carve `need` payload bytes out of FREE `block`, splitting off the
    /// remainder when it can host a whole block, mark the result USED, and
    /// return its payload pointer.
    ///
    /// # Safety
    /// `block` must be a valid FREE header linked in the free list with
    /// `size >= need`; `need` must be a multiple of 8.
    unsafe fn place(&mut self, block: NonNull<BlockHeader>, need: usize) -> NonNull<u8> {
        // Safety: upheld by caller.
        unsafe { self.free_list.remove(block) };
        // Safety: as above.
        let size = unsafe { (*block.as_ptr()).size };
        debug_assert!(size >= need);

        if size - need >= MIN_SPLIT {
            // Split: shrink this block to `need` and carve the remainder
            // into a new FREE block right behind it.
            // Safety: the remainder span lies inside the original block.
            unsafe {
                (*block.as_ptr()).size = need;
                (*block.as_ptr()).tag = USED_TAG;
                BlockHeader::write_footer(block);

                let rem_at = BlockHeader::end_addr(block);
                let rem = BlockHeader::init_free(
                    NonNull::new_unchecked(rem_at as *mut u8),
                    size - need - BLOCK_OVERHEAD,
                );
                self.free_list.insert(rem);
            }
            self.block_count += 1;
            self.free_bytes -= need + BLOCK_OVERHEAD;
            self.allocated_bytes += need;
        } else {
            // Remainder too small to host a block: hand out the whole thing.
            // Safety: upheld by caller.
            unsafe {
                (*block.as_ptr()).tag = USED_TAG;
                BlockHeader::write_footer(block);
            }
            self.free_bytes -= size;
            self.allocated_bytes += size;
        }
        BlockHeader::payload(block)
    }
}

static GLOBAL_HEAP: OnceLock<Mutex<Heap>> = OnceLock::new();

/// Process-wide heap behind a mutex.
///
/// The core [`Heap`] is single-threaded by contract; this facade is the one
/// sanctioned way to share it, serializing every operation through a single
/// lock.
pub struct GlobalHeap;

impl GlobalHeap {
    fn ensure_initialized() -> Result<&'static Mutex<Heap>, HeapError> {
        if let Some(heap) = GLOBAL_HEAP.get() {
            return Ok(heap);
        }

        let candidate = Mutex::new(Heap::new()?);
        drop(GLOBAL_HEAP.set(candidate));
        Ok(GLOBAL_HEAP
            .get()
            .expect("GlobalHeap should be initialized"))
    }

    /// Idempotent process-wide heap setup. A second call is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the initial region cannot be mapped.
    pub fn init() {
        if let Err(e) = Self::ensure_initialized() {
            panic!("Failed to init GlobalHeap: {e}");
        }
    }

    /// Allocate from the global heap, initializing it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    ///
    /// # Errors
    ///
    /// Returns `HeapError` if allocation fails (e.g. OOM).
    pub fn alloc(size: usize) -> Result<NonNull<u8>, HeapError> {
        Self::ensure_initialized()?.lock().unwrap().alloc(size)
    }

    /// Free a pointer previously returned by [`GlobalHeap::alloc`]. Null is
    /// a no-op.
    ///
    /// # Safety
    /// - A non-null `ptr` must have come from `GlobalHeap::alloc`.
    /// - `ptr` must not have been freed already.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned, or if a non-null pointer is
    /// freed before the global heap was ever initialized.
    pub unsafe fn free(ptr: *mut u8) {
        if let Some(heap) = GLOBAL_HEAP.get() {
            // Safety: contract forwarded to Heap::free.
            unsafe { heap.lock().unwrap().free(ptr) };
        } else if !ptr.is_null() {
            panic!("GlobalHeap not initialized but free called");
        }
    }

    /// Snapshot of the global heap's gauges, or `None` before first use.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    #[must_use]
    pub fn stats() -> Option<HeapStats> {
        GLOBAL_HEAP.get().map(|heap| heap.lock().unwrap().stats())
    }
}
