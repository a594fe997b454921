//! Low-level memory reservation primitives.
//!
//! Everything above this crate treats memory as opaque regions: ask for `N`
//! bytes (optionally aligned to a large power of two), get back an owning
//! [`Mmap`] handle, drop it to give the pages back to the OS.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
use fallback as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Unix this is the page size. The fallback backend reports the same
/// value it uses for page rounding.
pub fn allocation_granularity() -> usize {
    os::page_size()
}

/// Rounds `len` up to the next multiple of `align` (a power of two).
#[must_use]
pub const fn round_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// [`round_up`] that reports overflow instead of wrapping.
#[must_use]
pub const fn checked_round_up(len: usize, align: usize) -> Option<usize> {
    match len.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is zero-sized. Never true for a mapping
    /// produced by [`MmapOptions`].
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside this mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self { len: 0 }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Creates an anonymous, page-aligned, read/write memory map.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length, or with the OS error if
    /// the mapping cannot be created.
    ///
    /// # Safety
    ///
    /// The returned region is owned by the `Mmap`; pointers derived from
    /// [`Mmap::ptr`] dangle once it is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe {
            os::MmapInner::map_anon(self.len)?
        };

        Ok(Mmap { inner })
    }

    /// Creates an anonymous read/write map whose start address is a multiple
    /// of `alignment`.
    ///
    /// The length is rounded up to the page size. `alignment` must be a power
    /// of two and a multiple of the page size.
    ///
    /// On Unix the region is obtained by over-reserving `len + alignment`
    /// bytes with no access rights, unmapping the unaligned prefix and
    /// suffix, and re-mapping exactly the aligned span read/write. If any
    /// step fails, every sub-region mapped so far is released before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a zero length or an unusable alignment, otherwise
    /// the OS error of the failing step.
    ///
    /// # Safety
    ///
    /// Same contract as [`MmapOptions::map_anon`].
    pub unsafe fn map_aligned(&self, alignment: usize) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if !alignment.is_power_of_two() || alignment % page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two and a multiple of the page size",
            ));
        }

        let len = checked_round_up(self.len, page_size())
            .filter(|len| len.checked_add(alignment).is_some())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "length overflows the address space",
                )
            })?;
        let inner = unsafe { os::MmapInner::map_aligned(len, alignment)? };
        debug_assert_eq!(inner.ptr() as usize % alignment, 0);

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}
