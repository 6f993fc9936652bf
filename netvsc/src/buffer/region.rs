//! Heap-backed memory shared with the peer.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr::{self, NonNull};

/// A zeroed, fixed-size region that gets exported to the peer.
///
/// Once exported the peer may read or write it at any time, so access goes
/// through raw pointers rather than long-lived references.
pub struct SharedRegion {
    /// Start of the region.
    ptr: NonNull<u8>,
    /// Size in bytes.
    len: usize,
}

impl SharedRegion {
    /// Allocate a zero-initialized region.
    pub fn zeroed(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        // Box::into_raw never returns null.
        let ptr = NonNull::new(raw).unwrap_or(NonNull::dangling());
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[offset, offset + len)` lies inside the region.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.len)
    }

    /// Copy `data` into the region at `offset`.
    ///
    /// # Safety
    /// The caller must own `[offset, offset + data.len())` exclusively: no
    /// other writer, and the peer is not reading it.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        assert!(self.contains(offset, data.len()), "write outside shared region");
        ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
    }

    /// Zero `[offset, offset + len)`.
    ///
    /// # Safety
    /// Same ownership rule as [`write`](Self::write).
    pub unsafe fn fill_zero(&self, offset: usize, len: usize) {
        assert!(self.contains(offset, len), "write outside shared region");
        ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len);
    }

    /// Borrow `[offset, offset + len)`, or `None` if out of bounds.
    ///
    /// # Safety
    /// The caller must ensure nobody writes the range while the slice lives.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if !self.contains(offset, len) {
            return None;
        }
        Some(core::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len))
    }

    /// Give up the memory without freeing it.
    ///
    /// Used when the peer may still reference the region.
    pub fn leak(self) {
        core::mem::forget(self);
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from Box::into_raw in `zeroed`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)));
        }
    }
}

// SAFETY: the region is plain bytes; exclusive access to sub-ranges is
// arbitrated by the send slot map and the receive ownership protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}
