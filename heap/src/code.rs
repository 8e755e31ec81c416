use std::ptr::NonNull;

use crate::system::{map_executable_memory, page_align, unmap_memory};

/// Append-only arena of generated machine code.
///
/// A blob is one executable mapping with a bump cursor. Bytes, once copied
/// in, never move and are never overwritten, so an offset handed out by
/// [`CodeBlob::append`] stays valid until the blob is dropped.
pub struct CodeBlob {
    start: NonNull<u8>,
    capacity: usize,
    used: usize,
}

// SAFETY: the mapping is owned exclusively by the blob; appends require
// `&mut self`, and published bytes are immutable afterwards.
unsafe impl Send for CodeBlob {}
unsafe impl Sync for CodeBlob {}

impl CodeBlob {
    /// Map a new blob of at least `size` bytes. Returns `None` if the OS
    /// refuses the mapping.
    pub fn new(size: usize) -> Option<Self> {
        let capacity = page_align(size.max(1));
        let start = map_executable_memory(capacity)?;
        log::debug!("code blob mapped: {capacity} bytes at {start:p}");
        Some(Self {
            start,
            capacity,
            used: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        len <= self.remaining()
    }

    /// Copy `code` to the bump cursor and return its offset in the blob,
    /// or `None` if the blob lacks room.
    pub fn append(&mut self, code: &[u8]) -> Option<usize> {
        if !self.fits(code.len()) {
            return None;
        }
        let offset = self.used;
        // SAFETY: offset + len <= capacity, and the destination is past the
        // cursor so it never aliases published code.
        unsafe {
            core::ptr::copy_nonoverlapping(
                code.as_ptr(),
                self.start.as_ptr().add(offset),
                code.len(),
            );
        }
        self.used += code.len();
        Some(offset)
    }

    /// Entry address of the code at `offset`.
    #[inline]
    pub fn entry(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.used);
        // SAFETY: offset is inside the mapping
        unsafe { self.start.as_ptr().add(offset) }
    }

    /// The published bytes in `offset..offset + len`, or `None` if the range
    /// is not fully published.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.used {
            return None;
        }
        // SAFETY: range is inside the published prefix
        Some(unsafe {
            core::slice::from_raw_parts(self.start.as_ptr().add(offset), len)
        })
    }
}

impl Drop for CodeBlob {
    fn drop(&mut self) {
        unmap_memory(self.start, self.capacity);
    }
}

impl core::fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CodeBlob")
            .field("start", &self.start)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}
