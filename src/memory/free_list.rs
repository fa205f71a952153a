use super::block::{BlockHeader, FREE_TAG};
use std::ptr::NonNull;

/// Intrusive doubly-linked list threading all FREE blocks through the link
/// fields of their headers.
///
/// Insertion is push-front, so insertion order (LIFO) doubles as the
/// deterministic first-fit scan order. Links are purely structural: the list
/// never owns block memory, it only references headers living in the heap.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: *mut BlockHeader,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Link a FREE block at the front of the list.
    ///
    /// # Safety
    /// `block` must point at a valid header tagged [`FREE_TAG`] that is not
    /// currently linked into any list.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>) {
        // Safety: upheld by caller.
        unsafe {
            debug_assert_eq!((*block.as_ptr()).tag, FREE_TAG, "inserting a non-free block");
            (*block.as_ptr()).prev = std::ptr::null_mut();
            (*block.as_ptr()).next = self.head;
            if let Some(head) = NonNull::new(self.head) {
                (*head.as_ptr()).prev = block.as_ptr();
            }
        }
        self.head = block.as_ptr();
        self.len += 1;
    }

    /// Unlink a specific block.
    ///
    /// # Safety
    /// `block` must currently be linked into this list.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        debug_assert!(self.len > 0, "removing from an empty free list");
        // Safety: upheld by caller; neighbors are valid linked headers.
        unsafe {
            let prev = (*block.as_ptr()).prev;
            let next = (*block.as_ptr()).next;

            if prev.is_null() {
                debug_assert_eq!(self.head, block.as_ptr(), "unlinked block has no prev");
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }

            (*block.as_ptr()).prev = std::ptr::null_mut();
            (*block.as_ptr()).next = std::ptr::null_mut();
        }
        self.len -= 1;
    }

    /// First-fit placement search: the first block, in insertion order, whose
    /// payload capacity is at least `need`.
    ///
    /// # Safety
    /// Every linked block must be a valid FREE header.
    pub unsafe fn find_fit(&self, need: usize) -> Option<NonNull<BlockHeader>> {
        let mut cursor = self.head;
        while let Some(block) = NonNull::new(cursor) {
            // Safety: upheld by caller.
            unsafe {
                if (*block.as_ptr()).size >= need {
                    return Some(block);
                }
                cursor = (*block.as_ptr()).next;
            }
        }
        None
    }
}
