//! Chunked mark stack on a private scratch space.
//!
//! Chunks are bump-allocated from one fixed mapping and never freed
//! individually; [`MarkStack::reset`] rewinds the whole space at once. The
//! collector therefore never competes with the mutator's allocator for
//! memory while marking.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::ptr::{self, NonNull};

use sys_alloc::{Mmap, MmapOptions};

use crate::error::GcError;
use crate::object::ObjectRef;

/// Entries per chunk.
pub const CHUNK_ENTRIES: usize = 490;

/// One link of the mark stack.
#[repr(C)]
pub struct StackChunk {
    prev: *mut StackChunk,
    top: usize,
    entries: [MaybeUninit<ObjectRef>; CHUNK_ENTRIES],
}

const _: () = assert!(size_of::<StackChunk>() <= 4016);

/// Bump allocator over a fixed anonymous mapping.
struct ScratchSpace {
    region: Mmap,
    used: usize,
}

impl ScratchSpace {
    fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: the mapping is owned here and outlives every chunk carved
        // out of it.
        let region = unsafe { MmapOptions::new().len(capacity).map_anon()? };
        Ok(Self { region, used: 0 })
    }

    fn alloc_chunk(&mut self) -> Option<NonNull<StackChunk>> {
        let size = size_of::<StackChunk>();
        if self.used + size > self.region.len() {
            return None;
        }
        // SAFETY: in bounds; the region is page aligned and `size` keeps
        // every chunk pointer-aligned.
        #[allow(clippy::cast_ptr_alignment)]
        let chunk = unsafe { self.region.ptr().add(self.used).cast::<StackChunk>() };
        self.used += size;
        unsafe {
            ptr::addr_of_mut!((*chunk).prev).write(ptr::null_mut());
            ptr::addr_of_mut!((*chunk).top).write(0);
        }
        NonNull::new(chunk)
    }

    const fn clear(&mut self) {
        self.used = 0;
    }
}

/// LIFO worklist of GREY objects.
///
/// Chunks emptied by `pop` are chained onto `spare` (through their `prev`
/// link) and reused before new scratch space is carved, so a stack that
/// oscillates across a chunk boundary does not consume the space.
pub struct MarkStack {
    space: ScratchSpace,
    head: NonNull<StackChunk>,
    spare: *mut StackChunk,
    len: usize,
}

// SAFETY: the stack exclusively owns its scratch space; chunk pointers never
// escape it.
unsafe impl Send for MarkStack {}

impl MarkStack {
    /// Maps `capacity` bytes of scratch space and starts with one chunk.
    ///
    /// # Errors
    ///
    /// [`GcError::RegionMap`] if the scratch space cannot be mapped,
    /// [`GcError::ScratchSpaceExhausted`] if it cannot hold one chunk.
    pub fn new(capacity: usize) -> Result<Self, GcError> {
        let mut space = ScratchSpace::new(capacity).map_err(|source| GcError::RegionMap {
            len: capacity,
            source,
        })?;
        let head = space
            .alloc_chunk()
            .ok_or(GcError::ScratchSpaceExhausted { capacity })?;
        Ok(Self {
            space,
            head,
            spare: ptr::null_mut(),
            len: 0,
        })
    }

    /// Pushes a GREY object.
    ///
    /// # Panics
    ///
    /// Panics with [`GcError::ScratchSpaceExhausted`] when the scratch space
    /// cannot hold another chunk. Marking cannot continue without losing
    /// liveness information, so there is nothing to recover.
    pub fn push(&mut self, obj: ObjectRef) {
        // SAFETY: `head` always points at a chunk inside `space`.
        let mut chunk = unsafe { &mut *self.head.as_ptr() };
        if chunk.top == CHUNK_ENTRIES {
            let Some(next) = self.take_spare().or_else(|| self.space.alloc_chunk()) else {
                let err = GcError::ScratchSpaceExhausted {
                    capacity: self.space.region.len(),
                };
                #[cfg(feature = "tracing")]
                tracing::error!(capacity = self.space.region.len(), "mark_stack_exhausted");
                panic!("{err}");
            };
            unsafe { (*next.as_ptr()).prev = self.head.as_ptr() };
            self.head = next;
            chunk = unsafe { &mut *next.as_ptr() };
        }
        chunk.entries[chunk.top].write(obj);
        chunk.top += 1;
        self.len += 1;
    }

    /// Pops the most recently pushed object.
    pub fn pop(&mut self) -> Option<ObjectRef> {
        let mut chunk = unsafe { &mut *self.head.as_ptr() };
        if chunk.top == 0 {
            let prev = NonNull::new(chunk.prev)?;
            chunk.prev = self.spare;
            self.spare = self.head.as_ptr();
            self.head = prev;
            chunk = unsafe { &mut *prev.as_ptr() };
        }
        chunk.top -= 1;
        self.len -= 1;
        // SAFETY: every entry below `top` was written by `push`.
        Some(unsafe { chunk.entries[chunk.top].assume_init() })
    }

    fn take_spare(&mut self) -> Option<NonNull<StackChunk>> {
        let chunk = NonNull::new(self.spare)?;
        // SAFETY: spare chunks live in `space` and are unused.
        unsafe {
            self.spare = (*chunk.as_ptr()).prev;
            (*chunk.as_ptr()).prev = ptr::null_mut();
            (*chunk.as_ptr()).top = 0;
        }
        Some(chunk)
    }

    /// Whether no entries remain.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Scratch bytes handed out since the last reset.
    #[must_use]
    pub const fn scratch_used(&self) -> usize {
        self.space.used
    }

    /// Drops every entry and rewinds the scratch space.
    pub fn reset(&mut self) {
        self.space.clear();
        self.spare = ptr::null_mut();
        // A fresh space always fits the first chunk; `new` checked that.
        if let Some(head) = self.space.alloc_chunk() {
            self.head = head;
        }
        self.len = 0;
    }
}

impl std::fmt::Debug for MarkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkStack")
            .field("len", &self.len)
            .field("scratch_used", &self.space.used)
            .field("capacity", &self.space.region.len())
            .finish()
    }
}
