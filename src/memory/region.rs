use super::heap::HeapError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use log::{debug, trace};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Growth granularity: commits are rounded up to 64 KiB.
pub(crate) const GROWTH_CHUNK: usize = 64 * 1024;

/// Default address-space reservation per heap.
pub(crate) const DEFAULT_RESERVED: usize = 1024 * 1024 * 1024;

/// Default initially-committed heap span.
pub(crate) const DEFAULT_INITIAL: usize = 64 * 1024;

/// The OS-backed memory range `[heap_start, heap_end)`.
///
/// The whole `reserved` span is mapped up front (inaccessible); `grow`
/// commits further pages inside it, so the heap extends contiguously and
/// `heap_end` only ever advances. Committed pages are never returned to the
/// OS until the region itself is dropped.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
}

// Safety: Region owns its mapping exclusively; the raw pointer is not shared.
unsafe impl Send for Region {}

impl Region {
    /// Reserve `reserved` bytes of address space and commit the leading
    /// `initial` bytes. Both are rounded up to the growth chunk.
    ///
    /// # Errors
    ///
    /// Returns `HeapError` if the OS refuses the reservation or the initial
    /// commit.
    pub fn new(reserved: usize, initial: usize) -> Result<Self, HeapError> {
        let reserved = reserved.next_multiple_of(GROWTH_CHUNK);
        let initial = initial.next_multiple_of(GROWTH_CHUNK);
        debug_assert!(initial <= reserved, "initial span exceeds reservation");

        // Safety: FFI call to reserve address space.
        let base = unsafe { PlatformVmOps::reserve(reserved)? };
        stats::TOTAL_RESERVED.fetch_add(reserved, Ordering::Relaxed);

        // Safety: [base, base + initial) lies inside the reservation.
        if let Err(e) = unsafe { PlatformVmOps::commit(base, initial) } {
            // Safety: releasing the mapping we just created.
            unsafe { drop(PlatformVmOps::release(base, reserved)) };
            stats::sub_saturating(&stats::TOTAL_RESERVED, reserved);
            return Err(e.into());
        }
        stats::TOTAL_COMMITTED.fetch_add(initial, Ordering::Relaxed);

        debug!("heap region: reserved {reserved} bytes at {base:p}, committed {initial}");
        Ok(Self {
            base,
            reserved,
            committed: initial,
        })
    }

    /// Commit at least `min_additional` more bytes at the current heap end,
    /// returning the number of bytes actually added.
    ///
    /// Growth policy: the larger of `min_additional` rounded to the growth
    /// chunk and the current committed size (doubling), capped by the
    /// remaining reservation. Over-committing amortizes future growth calls.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` when the reservation cannot cover
    /// `min_additional`, or a VM error if the OS refuses the commit. The
    /// existing heap span stays valid either way.
    pub fn grow(&mut self, min_additional: usize) -> Result<usize, HeapError> {
        let needed = min_additional
            .checked_next_multiple_of(GROWTH_CHUNK)
            .ok_or(HeapError::OutOfMemory {
                requested: min_additional,
            })?;
        let remaining = self.reserved - self.committed;
        if needed > remaining {
            return Err(HeapError::OutOfMemory {
                requested: min_additional,
            });
        }
        let added = needed.max(self.committed).min(remaining);

        // Safety: [heap_end, heap_end + added) lies inside the reservation.
        let at = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed)) };
        // Safety: FFI call to commit pages inside our reservation.
        unsafe { PlatformVmOps::commit(at, added)? };

        self.committed += added;
        stats::TOTAL_COMMITTED.fetch_add(added, Ordering::Relaxed);
        trace!(
            "heap region: grew by {added} bytes (requested {min_additional}), end {:#x}",
            self.end()
        );
        Ok(added)
    }

    /// `heap_start` as an address.
    #[must_use]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// `heap_end` as an address (exclusive, advances monotonically).
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.committed
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing dereferences it past drop.
        unsafe { drop(PlatformVmOps::release(self.base, self.reserved)) };
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reserved);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, self.committed);
    }
}
