use std::ptr::NonNull;

/// Alignment contract: every payload pointer handed to callers is 8-aligned,
/// and every payload capacity is a multiple of 8.
pub(crate) const ALIGN: usize = 8;

/// Header bytes preceding every payload. A multiple of 8, so an aligned block
/// start yields an aligned payload automatically.
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Boundary-tag footer bytes trailing every payload.
pub(crate) const FOOTER_SIZE: usize = 8;

/// Total metadata bytes per block.
pub(crate) const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest payload a block may carry. Zero-size allocations are rounded up
/// to this.
pub(crate) const MIN_PAYLOAD: usize = ALIGN;

/// A free block is split only when the leftover bytes can host a whole block
/// of their own; anything smaller is handed out as slack instead of becoming
/// an unusable sliver.
pub(crate) const MIN_SPLIT: usize = BLOCK_OVERHEAD + MIN_PAYLOAD;

/// State tag of a live (allocated) block. Doubles as a corruption canary:
/// `free` verifies it before touching any other field.
pub(crate) const USED_TAG: u64 = 0xA110_CA7E_A110_CA7E;

/// State tag of a block on the free list.
pub(crate) const FREE_TAG: u64 = 0xF4EE_B10C_F4EE_B10C;

/// Low bit of a footer word: set while the owning block is free. Payload
/// sizes are multiples of 8, leaving the low bits of the mirrored size clear.
const FOOTER_FREE_BIT: usize = 1;

/// Per-block metadata embedded at the start of the block's byte range.
///
/// A block occupies `[header][payload (size bytes)][footer (8 bytes)]`; the
/// footer mirrors `size` plus the free bit so the physically following block
/// can find this header in O(1) during backward coalescing.
///
/// `prev`/`next` are intrusive free-list links, meaningful only while `tag`
/// is [`FREE_TAG`].
#[repr(C)]
pub(crate) struct BlockHeader {
    pub size: usize,
    pub tag: u64,
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
}

impl BlockHeader {
    /// Write a fresh FREE block spanning `[at, at + BLOCK_OVERHEAD + size)`.
    ///
    /// # Safety
    /// `at` must be 8-aligned and the whole span must be committed memory
    /// owned by the caller, not overlapping any other block.
    pub unsafe fn init_free(at: NonNull<u8>, size: usize) -> NonNull<BlockHeader> {
        debug_assert!(size >= MIN_PAYLOAD && size.is_multiple_of(ALIGN));
        debug_assert!((at.as_ptr() as usize).is_multiple_of(ALIGN));
        let header = at.cast::<BlockHeader>();
        // Safety: span validity upheld by caller.
        unsafe {
            header.as_ptr().write(BlockHeader {
                size,
                tag: FREE_TAG,
                prev: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
            });
            Self::write_footer(header);
        }
        header
    }

    /// Address of the payload handed to callers.
    #[inline]
    pub fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
        // Safety: the payload directly follows the header within the block.
        unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Recover the header from a payload pointer previously produced by
    /// [`payload`](Self::payload).
    ///
    /// # Safety
    /// `payload` must point at the payload of a block inside the heap.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        // Safety: inverse of `payload`; contract upheld by caller.
        unsafe { NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)).cast() }
    }

    /// One-past-the-end address of the whole block (header + payload + footer).
    ///
    /// # Safety
    /// `block` must point at a valid header.
    #[inline]
    pub unsafe fn end_addr(block: NonNull<BlockHeader>) -> usize {
        // Safety: upheld by caller.
        let size = unsafe { (*block.as_ptr()).size };
        block.as_ptr() as usize + HEADER_SIZE + size + FOOTER_SIZE
    }

    /// Mirror `size` and the free bit into the footer at the end of the block.
    /// Must be called whenever `size` or `tag` changes.
    ///
    /// # Safety
    /// `block` must point at a valid header whose payload+footer span is
    /// committed memory.
    pub unsafe fn write_footer(block: NonNull<BlockHeader>) {
        // Safety: upheld by caller.
        unsafe {
            let h = &*block.as_ptr();
            let footer = (block.as_ptr() as usize + HEADER_SIZE + h.size) as *mut usize;
            let free_bit = if h.tag == FREE_TAG { FOOTER_FREE_BIT } else { 0 };
            footer.write(h.size | free_bit);
        }
    }

    /// Header of the physically preceding block, located through its boundary
    /// tag, together with its free flag.
    ///
    /// # Safety
    /// `addr` must be the start address of a block that is not the first
    /// block of the heap, so that a footer ends exactly at `addr`.
    pub unsafe fn prev_neighbor(addr: usize) -> (NonNull<BlockHeader>, bool) {
        // Safety: upheld by caller.
        let word = unsafe { *((addr - FOOTER_SIZE) as *const usize) };
        let size = word & !(ALIGN - 1);
        let is_free = word & FOOTER_FREE_BIT != 0;
        let header = (addr - FOOTER_SIZE - size - HEADER_SIZE) as *mut BlockHeader;
        // Safety: a footer always belongs to a block inside the heap.
        (unsafe { NonNull::new_unchecked(header) }, is_free)
    }

    /// Header of the physically following block, or `None` when this block
    /// ends exactly at `heap_end`.
    ///
    /// # Safety
    /// `block` must point at a valid header inside `[heap_start, heap_end)`.
    pub unsafe fn next_neighbor(
        block: NonNull<BlockHeader>,
        heap_end: usize,
    ) -> Option<NonNull<BlockHeader>> {
        // Safety: upheld by caller.
        let end = unsafe { Self::end_addr(block) };
        debug_assert!(end <= heap_end, "block extends past heap_end");
        if end == heap_end {
            None
        } else {
            // Safety: blocks tile the heap, so `end` starts the next header.
            Some(unsafe { NonNull::new_unchecked(end as *mut BlockHeader) })
        }
    }

    /// Verify the tag marks a live block. Panics loudly on mismatch (double
    /// or invalid free) instead of corrupting the free list.
    ///
    /// # Safety
    /// `block` must point at readable memory inside the heap.
    pub unsafe fn check_live(block: NonNull<BlockHeader>, payload: *const u8) {
        // Safety: upheld by caller.
        let tag = unsafe { (*block.as_ptr()).tag };
        assert!(
            tag != FREE_TAG,
            "heap corruption: double free of {payload:p}"
        );
        assert!(
            tag == USED_TAG,
            "heap corruption: free of invalid pointer {payload:p} (tag 0x{tag:016x})"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An aligned scratch buffer big enough for a few blocks.
    fn scratch() -> Vec<u64> {
        vec![0u64; 256]
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(HEADER_SIZE, 32);
        assert!(HEADER_SIZE.is_multiple_of(ALIGN));
        assert!(FOOTER_SIZE.is_multiple_of(ALIGN));
        assert_eq!(BLOCK_OVERHEAD, 40);
        assert_eq!(MIN_SPLIT, BLOCK_OVERHEAD + MIN_PAYLOAD);
    }

    #[test]
    fn test_payload_roundtrip() {
        let mut buf = scratch();
        let at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: Test code; buffer owns the span.
        let block = unsafe { BlockHeader::init_free(at, 64) };

        let payload = BlockHeader::payload(block);
        assert_eq!(payload.as_ptr() as usize, block.as_ptr() as usize + HEADER_SIZE);
        assert!((payload.as_ptr() as usize).is_multiple_of(ALIGN));

        // Safety: Test code.
        let back = unsafe { BlockHeader::from_payload(payload) };
        assert_eq!(back, block);
    }

    #[test]
    fn test_footer_mirrors_state() {
        let mut buf = scratch();
        let at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: Test code.
        let block = unsafe { BlockHeader::init_free(at, 48) };

        // Safety: Test code; the block we just wrote is the "previous"
        // neighbor of the address right after it.
        unsafe {
            let after = BlockHeader::end_addr(block);
            let (prev, is_free) = BlockHeader::prev_neighbor(after);
            assert_eq!(prev, block);
            assert!(is_free);

            (*block.as_ptr()).tag = USED_TAG;
            BlockHeader::write_footer(block);
            let (prev, is_free) = BlockHeader::prev_neighbor(after);
            assert_eq!(prev, block);
            assert!(!is_free);
        }
    }

    #[test]
    fn test_neighbor_navigation() {
        let mut buf = scratch();
        let at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Two adjacent blocks tiling a 192-byte span.
        // Safety: Test code.
        unsafe {
            let first = BlockHeader::init_free(at, 56); // 96 bytes total
            let second_at = NonNull::new_unchecked(at.as_ptr().add(96));
            let second = BlockHeader::init_free(second_at, 56);

            let heap_end = at.as_ptr() as usize + 192;
            assert_eq!(BlockHeader::next_neighbor(first, heap_end), Some(second));
            assert_eq!(BlockHeader::next_neighbor(second, heap_end), None);

            let (prev, is_free) = BlockHeader::prev_neighbor(second.as_ptr() as usize);
            assert_eq!(prev, first);
            assert!(is_free);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_check_live_rejects_free_block() {
        let mut buf = scratch();
        let at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: Test code.
        unsafe {
            let block = BlockHeader::init_free(at, 32);
            BlockHeader::check_live(block, BlockHeader::payload(block).as_ptr());
        }
    }

    #[test]
    #[should_panic(expected = "invalid pointer")]
    fn test_check_live_rejects_garbage_tag() {
        let mut buf = scratch();
        let at = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: Test code.
        unsafe {
            let block = at.cast::<BlockHeader>();
            (*block.as_ptr()).tag = 0xDEAD_BEEF;
            BlockHeader::check_live(block, at.as_ptr());
        }
    }
}
