//! Aligned arenas.
//!
//! An arena is one aligned region holding objects of a single size class.
//! The region starts with a small, address-derived offset, then the
//! [`ArenaHeader`], then the bytemap (one mark byte per object), then the
//! object area:
//!
//! ```text
//! base                                                        base + len
//! | offset | ArenaHeader | bytemap[num_objects] | pad | objects ... |
//! ```
//!
//! Because `base` is aligned to [`ARENA_ALIGNMENT`], masking the low bits of
//! any pointer into the arena yields `base`, and the header sits at a fixed
//! offset from there. That is all [`chunk_from_ptr`] does.
//!
//! The in-region header is written once at creation and never changes, so the
//! concurrent marker may read it without synchronisation. Allocation state
//! (bump frontier, free list, live count) lives in the owning [`Arena`]
//! handle instead.

use std::fmt;
use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use sys_alloc::{Mmap, MmapOptions};

use crate::object::{length_at, stamp_freed, FREED_LENGTH, SLOT_SIZE};

/// log2 of [`ARENA_ALIGNMENT`].
pub const ARENA_ALIGN_BITS: u32 = 20;

/// Alignment of every arena region (1 MiB).
pub const ARENA_ALIGNMENT: usize = 1 << ARENA_ALIGN_BITS;

/// Size of a fixed size-class arena.
pub const ARENA_SIZE: usize = ARENA_ALIGNMENT;

const ARENA_ALIGN_MASK: usize = ARENA_ALIGNMENT - 1;

/// Upper bound (exclusive) of the cache-colouring header offset.
pub const MAX_HEADER_OFFSET: usize = 2048;

/// Alignment of the first object in an arena.
pub const OBJECT_START_ALIGN: usize = 16;

/// Magic number identifying an arena header ("BYTM").
pub const ARENA_MAGIC: u32 = 0x4259_544D;

/// Tri-color mark stored in the bytemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    /// Not reached (yet).
    White = 0,
    /// Reached, children not scanned.
    Grey = 1,
    /// Reached and scanned.
    Black = 2,
}

impl Color {
    /// Decodes a raw mark byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::White,
            1 => Self::Grey,
            _ => Self::Black,
        }
    }
}

/// Stable index of an arena inside the heap's arena table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(pub(crate) u32);

impl ArenaId {
    /// The slab index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Immutable per-arena layout, stored inside the region.
#[repr(C)]
pub struct ArenaHeader {
    magic: u32,
    id: ArenaId,
    class: u8,
    object_bits: u8,
    object_size: usize,
    num_objects: usize,
    first: *mut u8,
}

impl ArenaHeader {
    /// Size class index of the arena.
    #[must_use]
    pub const fn class(&self) -> usize {
        self.class as usize
    }

    /// The arena's slab id.
    #[must_use]
    pub const fn id(&self) -> ArenaId {
        self.id
    }

    /// Bytes per object slot.
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Object capacity.
    #[must_use]
    pub const fn num_objects(&self) -> usize {
        self.num_objects
    }

    /// Address of the first object.
    #[must_use]
    pub fn first(&self) -> usize {
        self.first as usize
    }

    /// End of the object area.
    #[must_use]
    pub fn end(&self) -> usize {
        self.first() + self.object_size * self.num_objects
    }

    /// Pointer to the bytemap, immediately after the header.
    #[must_use]
    pub fn bytemap(&self) -> *mut u8 {
        ptr::from_ref(self).cast_mut().wrapping_add(1).cast::<u8>()
    }

    /// Bytemap index of any pointer into the object area.
    #[must_use]
    pub fn bytemap_index(&self, ptr: *const u8) -> usize {
        (ptr as usize - self.first()) >> self.object_bits
    }

    /// Whether the arena holds a single large object.
    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.object_bits as u32 == ARENA_ALIGN_BITS
    }

    /// Whether this header carries the arena magic.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == ARENA_MAGIC
    }
}

/// Cache-colouring offset of the header within an aligned region.
///
/// Derived from the high bits of the region's own address so that equal
/// size classes in different arenas do not all start on the same cache
/// line offset. Always word aligned and below [`MAX_HEADER_OFFSET`].
#[must_use]
pub const fn header_offset(base: usize) -> usize {
    ((base >> ARENA_ALIGN_BITS) & (MAX_HEADER_OFFSET - 1)) & !(SLOT_SIZE - 1)
}

/// Recovers the arena header owning `ptr`.
///
/// Valid for every address inside a fixed-class arena, and for the first
/// [`ARENA_ALIGNMENT`] bytes of a large-object arena (which covers the
/// object start).
#[must_use]
pub fn chunk_from_ptr(ptr: *const u8) -> *mut ArenaHeader {
    let base = ptr as usize & !ARENA_ALIGN_MASK;
    (base + header_offset(base)) as *mut ArenaHeader
}

/// Address of the mark byte for `obj`.
///
/// # Safety
///
/// `obj` must point into a live arena.
#[must_use]
pub unsafe fn mark_byte(obj: *const u8) -> *mut u8 {
    let header = unsafe { &*chunk_from_ptr(obj) };
    debug_assert!(header.is_valid(), "pointer {obj:p} is not inside an arena");
    let index = header.bytemap_index(obj);
    debug_assert!(index < header.num_objects, "bytemap index out of bounds");
    unsafe { header.bytemap().add(index) }
}

/// Number of objects a region can hold.
///
/// Solves `offset + header + n * (1 + object_size) + start_align <= region`
/// for `n`, then rounds `n` down to a whole number of words so the bytemap
/// has a word-aligned length.
#[must_use]
pub const fn objects_per_region(region_size: usize, object_size: usize, offset: usize) -> usize {
    let overhead = size_of::<ArenaHeader>() + offset + OBJECT_START_ALIGN;
    let n = (region_size - overhead) / (1 + object_size);
    n & !(SLOT_SIZE - 1)
}

const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

/// What a sweep of one arena found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaSweep {
    /// Objects found BLACK.
    pub live: usize,
    /// Objects that were allocated before the sweep and are now free.
    pub reclaimed: usize,
}

/// An arena and its allocation state. Owns the backing region.
pub struct Arena {
    region: Mmap,
    header: NonNull<ArenaHeader>,
    free: usize,
    free_list: *mut FreeObject,
    num_alloc: usize,
    was_full: bool,
}

impl Arena {
    fn map_region(len: usize) -> io::Result<Mmap> {
        // SAFETY: the Mmap is owned by the Arena and outlives every pointer
        // handed out from it.
        unsafe { MmapOptions::new().len(len).map_aligned(ARENA_ALIGNMENT) }
    }

    /// Creates an arena of [`ARENA_SIZE`] bytes for objects of
    /// `object_size` (a power of two).
    ///
    /// # Errors
    ///
    /// Propagates the region mapping error.
    pub fn new_fixed(id: ArenaId, class: usize, object_size: usize) -> io::Result<Self> {
        debug_assert!(object_size.is_power_of_two());
        let region = Self::map_region(ARENA_SIZE)?;
        let base = region.ptr() as usize;
        let offset = header_offset(base);
        let num_objects = objects_per_region(region.len(), object_size, offset);
        debug_assert!(num_objects > 0);

        let header = Self::write_header(
            &region,
            offset,
            id,
            class,
            object_size,
            object_size.trailing_zeros(),
            num_objects,
        );
        let arena = Self {
            free: unsafe { header.as_ref() }.first(),
            region,
            header,
            free_list: ptr::null_mut(),
            num_alloc: 0,
            was_full: false,
        };
        debug_assert!(arena.header().end() <= base + arena.region.len());
        Ok(arena)
    }

    /// Creates a dedicated arena for one object of `object_size` bytes.
    ///
    /// The object is allocated immediately; the arena starts out holding it.
    ///
    /// # Errors
    ///
    /// Propagates the region mapping error. `InvalidInput` when the region
    /// length does not fit in a `usize`.
    pub fn new_large(id: ArenaId, class: usize, object_size: usize) -> io::Result<Self> {
        let overhead =
            size_of::<ArenaHeader>() + MAX_HEADER_OFFSET + SLOT_SIZE + OBJECT_START_ALIGN;
        let len = object_size.checked_add(overhead).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "large object overflows the address space",
            )
        })?;
        let region = Self::map_region(len)?;
        let offset = header_offset(region.ptr() as usize);
        // With a shift of ARENA_ALIGN_BITS every pointer near the object
        // start maps to bytemap index 0.
        let header = Self::write_header(
            &region,
            offset,
            id,
            class,
            object_size,
            ARENA_ALIGN_BITS,
            1,
        );
        let end = unsafe { header.as_ref() }.end();
        debug_assert!(end <= region.ptr() as usize + region.len());
        Ok(Self {
            region,
            header,
            free: end,
            free_list: ptr::null_mut(),
            num_alloc: 1,
            was_full: false,
        })
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_ptr_alignment)]
    fn write_header(
        region: &Mmap,
        offset: usize,
        id: ArenaId,
        class: usize,
        object_size: usize,
        object_bits: u32,
        num_objects: usize,
    ) -> NonNull<ArenaHeader> {
        let base = region.ptr();
        // SAFETY: offset + header + bytemap + objects fit in the region by
        // construction, and the region is at least word aligned.
        unsafe {
            let header = base.add(offset).cast::<ArenaHeader>();
            let bytemap = header.add(1).cast::<u8>();
            let first = align_up(bytemap as usize + num_objects, OBJECT_START_ALIGN) as *mut u8;
            header.write(ArenaHeader {
                magic: ARENA_MAGIC,
                id,
                class: class as u8,
                object_bits: object_bits as u8,
                object_size,
                num_objects,
                first,
            });
            ptr::write_bytes(bytemap, Color::White as u8, num_objects);
            NonNull::new_unchecked(header)
        }
    }

    /// The immutable in-region header.
    #[must_use]
    pub fn header(&self) -> &ArenaHeader {
        // SAFETY: the header lives inside `self.region`, which we own.
        unsafe { self.header.as_ref() }
    }

    /// Raw header pointer, as recovered by [`chunk_from_ptr`].
    #[must_use]
    pub const fn header_ptr(&self) -> *mut ArenaHeader {
        self.header.as_ptr()
    }

    /// Aligned base address of the region.
    #[must_use]
    pub fn base(&self) -> usize {
        self.region.ptr() as usize
    }

    /// Bytes reserved from the OS.
    #[must_use]
    pub fn raw_size(&self) -> usize {
        self.region.len()
    }

    /// Whether `addr` lies in this arena's object area.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let h = self.header();
        addr >= h.first() && addr < h.end()
    }

    /// Live object count as of the last sweep plus allocations since.
    #[must_use]
    pub const fn num_alloc(&self) -> usize {
        self.num_alloc
    }

    /// Bump frontier: objects at or past it were never handed out.
    #[must_use]
    pub const fn frontier(&self) -> usize {
        self.free
    }

    /// Whether the arena was considered full after its last sweep.
    #[must_use]
    pub const fn was_full(&self) -> bool {
        self.was_full
    }

    pub(crate) const fn set_was_full(&mut self, was_full: bool) {
        self.was_full = was_full;
    }

    /// Fraction of capacity in use.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn occupancy(&self) -> f64 {
        self.num_alloc as f64 / self.header().num_objects() as f64
    }

    /// Pops the free list, else bumps the frontier. `None` when full.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if !self.free_list.is_null() {
            let obj = self.free_list;
            // SAFETY: free-list nodes are reclaimed object slots of this arena.
            self.free_list = unsafe { (*obj).next };
            self.num_alloc += 1;
            return NonNull::new(obj.cast::<u8>());
        }

        let (end, size) = (self.header().end(), self.header().object_size());
        if self.free < end {
            let obj = self.free as *mut u8;
            self.free += size;
            self.num_alloc += 1;
            return NonNull::new(obj);
        }

        None
    }

    /// Whether `addr` starts an object that was handed out and has not been
    /// reclaimed since.
    #[must_use]
    pub fn holds_object(&self, addr: usize) -> bool {
        let h = self.header();
        if addr < h.first() || addr >= self.free.min(h.end()) {
            return false;
        }
        if (addr - h.first()) % h.object_size() != 0 {
            return false;
        }
        // SAFETY: a slot below the frontier was initialised when allocated
        // and is stamped when swept.
        unsafe { length_at(addr) != FREED_LENGTH }
    }

    /// Mark of the object at bytemap index `index`.
    #[must_use]
    pub fn mark_at(&self, index: usize) -> Color {
        assert!(index < self.header().num_objects());
        // SAFETY: index is in bounds of the bytemap.
        Color::from_byte(unsafe { self.header().bytemap().add(index).read() })
    }

    /// Number of non-WHITE mark bytes.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        (0..self.header().num_objects())
            .filter(|&i| self.mark_at(i) != Color::White)
            .count()
    }

    /// Resets every mark byte to WHITE.
    pub fn clear_marks(&mut self) {
        let h = self.header();
        // SAFETY: the bytemap is `num_objects` bytes long.
        unsafe { ptr::write_bytes(h.bytemap(), Color::White as u8, h.num_objects()) };
    }

    /// Addresses of every object below the bump frontier.
    pub fn objects(&self) -> impl Iterator<Item = usize> + '_ {
        let h = self.header();
        (h.first()..self.free.min(h.end())).step_by(h.object_size())
    }

    /// Sweeps a fixed-class arena.
    ///
    /// WHITE objects below the frontier become free, BLACK objects are
    /// counted live and keep their mark. The frontier is pulled back to just
    /// past the last live object; WHITE slots below it are threaded onto a
    /// fresh free list unless most of the arena is still virgin space
    /// (`virgin_fraction >= freelist_virgin_threshold`), in which case the
    /// bump pointer alone serves future allocations.
    pub fn sweep(&mut self, freelist_virgin_threshold: f64) -> ArenaSweep {
        let h = self.header();
        let (first, end, size) = (h.first(), h.end(), h.object_size());
        let bytemap = h.bytemap();
        let before = self.num_alloc;

        if h.is_large() {
            return self.sweep_large();
        }

        #[allow(clippy::cast_precision_loss)]
        let virgin_fraction = (end - self.free) as f64 / (end - first) as f64;
        let build_free_list = virgin_fraction < freelist_virgin_threshold;

        let mut head: *mut FreeObject = ptr::null_mut();
        let mut tail: *mut FreeObject = ptr::null_mut();
        let mut tail_at_last_live: *mut FreeObject = ptr::null_mut();
        let mut last_live_end = first;
        let mut live = 0;

        let mut finger = first;
        let mut mark = bytemap;
        while finger < self.free {
            // SAFETY: `mark` walks the bytemap in lockstep with `finger`.
            let color = Color::from_byte(unsafe { mark.read() });
            debug_assert!(color != Color::Grey, "GREY object found during sweep");
            if color == Color::White {
                // SAFETY: `finger` is an object slot below the old frontier.
                unsafe { stamp_freed(finger) };
                if build_free_list {
                    let node = finger as *mut FreeObject;
                    unsafe { node.write(FreeObject { next: ptr::null_mut() }) };
                    if tail.is_null() {
                        head = node;
                    } else {
                        unsafe { (*tail).next = node };
                    }
                    tail = node;
                }
            } else {
                live += 1;
                last_live_end = finger + size;
                tail_at_last_live = tail;
            }
            finger += size;
            mark = mark.wrapping_add(1);
        }

        // Everything past the last survivor goes back to virgin space.
        self.free = last_live_end;
        if tail_at_last_live.is_null() {
            head = ptr::null_mut();
        } else {
            unsafe { (*tail_at_last_live).next = ptr::null_mut() };
        }

        self.free_list = head;
        self.num_alloc = live;
        ArenaSweep {
            live,
            reclaimed: before.saturating_sub(live),
        }
    }

    fn sweep_large(&mut self) -> ArenaSweep {
        let live = usize::from(self.mark_at(0) != Color::White);
        let reclaimed = self.num_alloc.saturating_sub(live);
        self.num_alloc = live;
        ArenaSweep { live, reclaimed }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header();
        f.debug_struct("Arena")
            .field("id", &h.id())
            .field("base", &format_args!("{:#x}", self.base()))
            .field("class", &h.class())
            .field("object_size", &h.object_size())
            .field("num_objects", &h.num_objects())
            .field("num_alloc", &self.num_alloc)
            .field("was_full", &self.was_full)
            .finish_non_exhaustive()
    }
}
