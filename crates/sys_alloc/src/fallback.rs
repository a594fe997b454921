//! Portable backend built on the global allocator's aligned allocation.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{self, Error};

const PAGE_SIZE: usize = 4096;

/// Page size assumed by the portable backend.
pub const fn page_size() -> usize {
    PAGE_SIZE
}

pub struct MmapInner {
    ptr: *mut u8,
    layout: Layout,
}

impl MmapInner {
    /// Allocates `len` zeroed, page-aligned bytes.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let len = crate::checked_round_up(len, PAGE_SIZE).ok_or_else(|| {
            Error::new(io::ErrorKind::InvalidInput, "length overflows the address space")
        })?;
        unsafe { Self::map_aligned(len, PAGE_SIZE) }
    }

    /// Allocates `len` zeroed bytes aligned to `alignment`.
    ///
    /// # Safety
    ///
    /// `len` must be non-zero and `alignment` a power of two.
    pub unsafe fn map_aligned(len: usize, alignment: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|e| Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::new(io::ErrorKind::OutOfMemory, "aligned allocation failed"));
        }
        Ok(Self { ptr, layout })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
