use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

/// Unmaps `len` bytes at `addr`, ignoring zero-length requests.
unsafe fn unmap(addr: usize, len: usize) {
    if len > 0 {
        unsafe {
            libc::munmap(addr as *mut libc::c_void, len);
        }
    }
}

impl MmapInner {
    /// Creates a new anonymous read/write memory mapping.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    /// Reserves `len + alignment` bytes of inaccessible address space, trims
    /// it down to the aligned span and commits that span read/write.
    ///
    /// # Safety
    ///
    /// `len` must be a multiple of the page size, `alignment` a power of two
    /// and a multiple of the page size, and `len + alignment` must not
    /// overflow.
    pub unsafe fn map_aligned(len: usize, alignment: usize) -> io::Result<Self> {
        let request = len + alignment;

        let reserved = unsafe {
            libc::mmap(
                ptr::null_mut(),
                request,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let base = reserved as usize;
        let aligned = (base + alignment - 1) & !(alignment - 1);
        let prefix = aligned - base;
        let suffix = (base + request) - (aligned + len);

        unsafe {
            unmap(base, prefix);
            unmap(aligned + len, suffix);
        }

        let committed = unsafe {
            libc::mmap(
                aligned as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if committed == libc::MAP_FAILED || committed as usize != aligned {
            let err = Error::last_os_error();
            unsafe { unmap(aligned, len) };
            return Err(err);
        }

        Ok(Self {
            ptr: committed,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
