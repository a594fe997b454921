//! Slot-array objects.
//!
//! Every object is a fixed [`ObjectHeader`] immediately followed by `length`
//! pointer-sized slots, each holding another object. Mark state never lives
//! here; it is kept out-of-band in the owning arena's bytemap.

use std::fmt;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of one child slot.
pub const SLOT_SIZE: usize = size_of::<usize>();

/// Bit 0 of the flag word: the object survived a mark phase.
const OLD_BIT: u32 = 1;

/// Largest value storable in the user tag (31 bits).
pub const MAX_TAG: u32 = u32::MAX >> 1;

/// Fixed object header.
///
/// The flag word is atomic because the concurrent marker sets the `old` bit
/// while the mutator may read or rewrite the tag.
#[repr(C)]
pub struct ObjectHeader {
    flags: AtomicU32,
    length: usize,
}

/// Size of [`ObjectHeader`] in bytes.
pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();

/// Header length of a slot reclaimed by a sweep. No object can be this long.
pub(crate) const FREED_LENGTH: usize = usize::MAX;

/// Marks the slot at `addr` as reclaimed.
///
/// # Safety
///
/// `addr` must be an object slot of a mapped arena.
pub(crate) unsafe fn stamp_freed(addr: usize) {
    let header = addr as *mut ObjectHeader;
    unsafe { ptr::addr_of_mut!((*header).length).write(FREED_LENGTH) };
}

/// Header length of the slot at `addr`, [`FREED_LENGTH`] if reclaimed.
///
/// # Safety
///
/// `addr` must be an object slot below its arena's bump frontier.
pub(crate) unsafe fn length_at(addr: usize) -> usize {
    let header = addr as *const ObjectHeader;
    unsafe { ptr::addr_of!((*header).length).read() }
}

/// Bytes needed for an object with `length` slots.
///
/// Only for lengths known to be small; see
/// [`checked_object_length_to_size`].
#[must_use]
pub const fn object_length_to_size(length: usize) -> usize {
    length * SLOT_SIZE + HEADER_SIZE
}

/// Bytes needed for an object with `length` slots, or `None` when that
/// does not fit in a `usize`.
#[must_use]
pub const fn checked_object_length_to_size(length: usize) -> Option<usize> {
    match length.checked_mul(SLOT_SIZE) {
        Some(slots) => slots.checked_add(HEADER_SIZE),
        None => None,
    }
}

/// Number of slots that fit in an object of `size` bytes.
#[must_use]
pub const fn object_size_to_length(size: usize) -> usize {
    (size - HEADER_SIZE) / SLOT_SIZE
}

/// A reference to a heap object.
///
/// Equality is address identity. An `ObjectRef` stays valid for as long as
/// the object is reachable from the heap's roots; the collector never moves
/// objects, so [`ObjectRef::addr`] is stable for the object's lifetime.
///
/// The handle itself is only an address. Reading the object goes through
/// [`GcHeap`](crate::GcHeap), which checks that it is still allocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

impl ObjectRef {
    /// Wraps a raw object pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at an initialised object header.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<ObjectHeader>) -> Self {
        Self(ptr)
    }

    /// The object's address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    pub(crate) fn as_byte_ptr(self) -> *const u8 {
        self.0.as_ptr().cast::<u8>().cast_const()
    }

    fn header(&self) -> &ObjectHeader {
        // SAFETY: an ObjectRef always points at an initialised header.
        unsafe { self.0.as_ref() }
    }

    /// Number of child slots.
    #[must_use]
    pub(crate) fn length(self) -> usize {
        self.header().length
    }

    /// The 31-bit user tag.
    #[must_use]
    pub(crate) fn tag(self) -> u32 {
        self.header().flags.load(Ordering::Relaxed) >> 1
    }

    /// Replaces the user tag, preserving the `old` bit.
    ///
    /// # Panics
    ///
    /// Panics if `tag` exceeds [`MAX_TAG`].
    pub(crate) fn set_tag(self, tag: u32) {
        assert!(tag <= MAX_TAG, "object tag {tag} exceeds 31 bits");
        let flags = &self.header().flags;
        let _ = flags.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((tag << 1) | (bits & OLD_BIT))
        });
    }

    /// Whether the object has survived a mark phase.
    #[must_use]
    pub(crate) fn is_old(self) -> bool {
        self.header().flags.load(Ordering::Relaxed) & OLD_BIT != 0
    }

    pub(crate) fn set_old(self) {
        self.header().flags.fetch_or(OLD_BIT, Ordering::Relaxed);
    }

    fn slots(self) -> *mut Self {
        // SAFETY: the slot array starts right after the header.
        unsafe { self.0.as_ptr().add(1).cast::<Self>() }
    }

    /// Reads slot `index` without bounds checking.
    ///
    /// # Safety
    ///
    /// The object must be live (see [`GcHeap::owns`](crate::GcHeap::owns))
    /// and `index` below its length.
    #[must_use]
    pub unsafe fn slot_unchecked(self, index: usize) -> Self {
        debug_assert!(index < self.length());
        unsafe { self.slots().add(index).read() }
    }

    /// Writes slot `index` without bounds checking and without the write
    /// barrier.
    ///
    /// # Safety
    ///
    /// The object must be live and `index` below its length, and the caller
    /// takes over the write barrier's duty of keeping the mark invariant
    /// intact.
    pub unsafe fn store_slot_unchecked(self, index: usize, value: Self) {
        debug_assert!(index < self.length());
        unsafe { self.slots().add(index).write(value) }
    }

    /// Writes a fresh header at `raw` and fills every slot with `nil`.
    ///
    /// # Safety
    ///
    /// `raw` must be valid for `object_length_to_size(length)` bytes and
    /// aligned for `ObjectHeader`.
    pub(crate) unsafe fn init(raw: NonNull<u8>, length: usize, nil: Option<Self>) -> Self {
        let header = raw.cast::<ObjectHeader>();
        unsafe {
            header.as_ptr().write(ObjectHeader {
                flags: AtomicU32::new(0),
                length,
            });
        }
        let obj = Self(header);
        // Nil itself is the only object created without a filler.
        let fill = nil.unwrap_or(obj);
        let slots = obj.slots();
        for i in 0..length {
            unsafe { slots.add(i).write(fill) };
        }
        obj
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}
