//! Segregated size-class heap.
//!
//! Eight fixed classes of power-of-two object sizes (32 bytes up to 4 KiB)
//! plus one class for large objects, each of which gets a dedicated arena.
//! Every class keeps two arena lists: `free` (arenas that may still satisfy
//! an allocation) and `full` (arenas that ran out of space). The head of
//! either list is the last element of its `Vec`.
//!
//! Arenas themselves live in a slab indexed by [`ArenaId`], so list
//! manipulation never chases raw pointers.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;

use crate::arena::{chunk_from_ptr, Arena, ArenaId, ARENA_ALIGNMENT};
use crate::metrics::{ArenaInfo, ClassStats, MemoryStatistics};
use crate::object::{object_length_to_size, HEADER_SIZE, SLOT_SIZE};

/// Number of fixed-size classes.
pub const NUM_FIXED_CLASSES: usize = 8;

/// Index of the large-object class.
pub const LARGE_CLASS: usize = NUM_FIXED_CLASSES;

/// Total number of classes.
pub const NUM_CLASSES: usize = NUM_FIXED_CLASSES + 1;

/// Object size of class 0.
pub const SMALLEST_SEGMENT_SIZE: usize = 32;

/// Object size of the largest fixed class.
pub const LARGEST_FIXED_SEGMENT_SIZE: usize = SMALLEST_SEGMENT_SIZE << (NUM_FIXED_CLASSES - 1);

const LOOKUP_TABLE_SIZE: usize = LARGEST_FIXED_SEGMENT_SIZE / SLOT_SIZE;

const _: () = {
    assert!(SMALLEST_SEGMENT_SIZE.is_power_of_two());
    assert!(SMALLEST_SEGMENT_SIZE >= HEADER_SIZE);
    assert!(SMALLEST_SEGMENT_SIZE <= 2 * HEADER_SIZE.next_power_of_two());
    assert!(LARGEST_FIXED_SEGMENT_SIZE < ARENA_ALIGNMENT);
};

/// Object size of fixed class `class`.
#[must_use]
pub const fn class_object_size(class: usize) -> usize {
    assert!(class < NUM_FIXED_CLASSES);
    SMALLEST_SEGMENT_SIZE << class
}

/// Maps an object length to its size class in O(1).
///
/// Lengths at or beyond the table size always go to [`LARGE_CLASS`].
#[derive(Clone)]
pub struct SizeClassLookup {
    table: [u8; LOOKUP_TABLE_SIZE],
}

impl SizeClassLookup {
    /// Builds the table: each entry is the smallest class whose object size
    /// holds an object of that length.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn build() -> Self {
        let mut table = [0u8; LOOKUP_TABLE_SIZE];
        let mut class = 0;
        let mut length = 0;
        while length < LOOKUP_TABLE_SIZE {
            let size = object_length_to_size(length);
            if size <= LARGEST_FIXED_SEGMENT_SIZE {
                if class_object_size(class) < size {
                    class += 1;
                }
                table[length] = class as u8;
            } else {
                table[length] = LARGE_CLASS as u8;
            }
            length += 1;
        }
        Self { table }
    }

    /// Class for an object of `length` slots.
    #[must_use]
    pub const fn class_for_length(&self, length: usize) -> usize {
        if length >= LOOKUP_TABLE_SIZE {
            LARGE_CLASS
        } else {
            self.table[length] as usize
        }
    }
}

impl fmt::Debug for SizeClassLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeClassLookup")
            .field("entries", &LOOKUP_TABLE_SIZE)
            .finish()
    }
}

/// Arena lists and sizing state of one class.
#[derive(Debug, Default)]
pub struct SizeClass {
    pub(crate) free: Vec<ArenaId>,
    pub(crate) full: Vec<ArenaId>,
    /// Arenas currently owned by the class.
    pub(crate) size: usize,
    /// Arenas the class may own before allocation must collect first.
    pub(crate) size_limit: usize,
}

impl SizeClass {
    /// Whether another arena may be mapped without collecting first.
    #[must_use]
    pub const fn can_grow(&self) -> bool {
        self.size < self.size_limit
    }

    /// Arenas currently owned.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Current arena limit.
    #[must_use]
    pub const fn size_limit(&self) -> usize {
        self.size_limit
    }
}

/// Why [`SizeClassHeap::alloc_in_class`] produced nothing.
#[derive(Debug)]
pub enum AllocFailure {
    /// Every arena is full and growth was not permitted.
    Exhausted,
    /// Growth was permitted but the OS refused the region.
    Map(io::Error),
}

/// All arenas of one collector instance, grouped by size class.
pub struct SizeClassHeap {
    classes: [SizeClass; NUM_CLASSES],
    slab: Vec<Option<Arena>>,
    vacant: Vec<ArenaId>,
    bases: HashMap<usize, ArenaId>,
    lookup: SizeClassLookup,
}

impl SizeClassHeap {
    /// Creates an empty heap; each class may grow to `initial_limit` arenas.
    #[must_use]
    pub fn new(initial_limit: usize) -> Self {
        Self {
            classes: std::array::from_fn(|_| SizeClass {
                size_limit: initial_limit,
                ..SizeClass::default()
            }),
            slab: Vec::new(),
            vacant: Vec::new(),
            bases: HashMap::new(),
            lookup: SizeClassLookup::build(),
        }
    }

    /// Size class for an object of `length` slots.
    #[must_use]
    pub const fn class_for_length(&self, length: usize) -> usize {
        self.lookup.class_for_length(length)
    }

    /// Lists and sizing state of `class`.
    #[must_use]
    pub fn class(&self, class: usize) -> &SizeClass {
        &self.classes[class]
    }

    pub(crate) fn class_mut(&mut self, class: usize) -> &mut SizeClass {
        &mut self.classes[class]
    }

    /// The arena behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was released.
    #[must_use]
    pub fn arena(&self, id: ArenaId) -> &Arena {
        self.slab[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("{id:?} has been released"))
    }

    pub(crate) fn arena_mut(&mut self, id: ArenaId) -> &mut Arena {
        self.slab[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("{id:?} has been released"))
    }

    /// Every live arena, in slab order.
    pub fn arenas(&self) -> impl Iterator<Item = &Arena> + '_ {
        self.slab.iter().flatten()
    }

    pub(crate) fn arenas_mut(&mut self) -> impl Iterator<Item = &mut Arena> + '_ {
        self.slab.iter_mut().flatten()
    }

    /// Number of live arenas.
    #[must_use]
    pub fn num_arenas(&self) -> usize {
        self.bases.len()
    }

    /// Whether `addr` is an allocated, unreclaimed object in one of the
    /// arenas.
    #[must_use]
    pub fn holds_object(&self, addr: usize) -> bool {
        self.arena_of(addr)
            .is_some_and(|id| self.arena(id).holds_object(addr))
    }

    /// The arena owning the object starting at `addr`, if any.
    #[must_use]
    pub fn arena_of(&self, addr: usize) -> Option<ArenaId> {
        let base = addr & !(ARENA_ALIGNMENT - 1);
        let id = *self.bases.get(&base)?;
        let arena = self.arena(id);
        debug_assert_eq!(chunk_from_ptr(addr as *const u8), arena.header_ptr());
        arena.contains(addr).then_some(id)
    }

    fn next_id(&mut self) -> ArenaId {
        if let Some(id) = self.vacant.pop() {
            return id;
        }
        let id = u32::try_from(self.slab.len()).map_or_else(
            |_| panic!("arena table exceeds u32::MAX entries"),
            ArenaId,
        );
        self.slab.push(None);
        id
    }

    fn insert(&mut self, arena: Arena) -> ArenaId {
        let id = arena.header().id();
        self.bases.insert(arena.base(), id);
        self.slab[id.index()] = Some(arena);
        id
    }

    fn map_arena(&mut self, class: usize, object_size: usize) -> io::Result<ArenaId> {
        let id = self.next_id();
        let mapped = if class == LARGE_CLASS {
            Arena::new_large(id, class, object_size)
        } else {
            Arena::new_fixed(id, class, object_size)
        };
        match mapped {
            Ok(arena) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    class,
                    object_size,
                    base = arena.base(),
                    size = arena.raw_size(),
                    "arena_mapped"
                );
                self.classes[class].size += 1;
                Ok(self.insert(arena))
            }
            Err(err) => {
                self.vacant.push(id);
                Err(err)
            }
        }
    }

    /// Allocates raw storage for one object of `object_size` bytes in
    /// `class`, mapping a new arena only if `grow` is set.
    ///
    /// Fixed classes try the head of the free list first; an arena that
    /// cannot satisfy the request moves to the full list and the next one is
    /// tried. The large class maps a dedicated arena per object, so it only
    /// succeeds when growth is allowed.
    ///
    /// # Errors
    ///
    /// [`AllocFailure::Exhausted`] when nothing fits and `grow` is unset,
    /// [`AllocFailure::Map`] when the new region could not be mapped.
    pub fn alloc_in_class(
        &mut self,
        class: usize,
        object_size: usize,
        grow: bool,
    ) -> Result<NonNull<u8>, AllocFailure> {
        if class == LARGE_CLASS {
            if !grow {
                return Err(AllocFailure::Exhausted);
            }
            let id = self.map_arena(class, object_size).map_err(AllocFailure::Map)?;
            self.classes[class].full.push(id);
            let first = self.arena(id).header().first() as *mut u8;
            return NonNull::new(first).ok_or(AllocFailure::Exhausted);
        }

        debug_assert!(object_size <= class_object_size(class));
        let mut grow = grow;
        loop {
            let id = match self.classes[class].free.last() {
                Some(&id) => id,
                None if grow => {
                    grow = false;
                    let id = self.map_arena(class, class_object_size(class)).map_err(AllocFailure::Map)?;
                    self.classes[class].free.push(id);
                    id
                }
                None => return Err(AllocFailure::Exhausted),
            };

            if let Some(obj) = self.arena_mut(id).alloc() {
                debug_assert_eq!(chunk_from_ptr(obj.as_ptr()), self.arena(id).header_ptr());
                return Ok(obj);
            }

            let sc = &mut self.classes[class];
            sc.free.pop();
            sc.full.push(id);
        }
    }

    /// Unmaps arena `id`. The caller must already have removed it from its
    /// class lists.
    pub(crate) fn release(&mut self, id: ArenaId) {
        let Some(arena) = self.slab[id.index()].take() else {
            return;
        };
        let class = arena.header().class();
        self.bases.remove(&arena.base());
        self.classes[class].size -= 1;
        self.vacant.push(id);
        #[cfg(feature = "tracing")]
        tracing::debug!(class, base = arena.base(), "arena_released");
        drop(arena);
    }

    /// Releases every arena.
    pub(crate) fn release_all(&mut self) {
        for class in 0..NUM_CLASSES {
            let sc = &mut self.classes[class];
            let ids: Vec<ArenaId> = sc.free.drain(..).chain(sc.full.drain(..)).collect();
            for id in ids {
                self.release(id);
            }
            debug_assert_eq!(self.classes[class].size, 0);
        }
    }

    /// Aggregate reserved, usable and used byte counts.
    #[must_use]
    pub fn memory_statistics(&self) -> MemoryStatistics {
        self.arenas().fold(MemoryStatistics::default(), |mut acc, arena| {
            let h = arena.header();
            acc.reserved += arena.raw_size();
            acc.usable += h.num_objects() * h.object_size();
            acc.used += arena.num_alloc() * h.object_size();
            acc
        })
    }

    /// List lengths and limits of `class`.
    #[must_use]
    pub fn class_stats(&self, class: usize) -> ClassStats {
        let sc = &self.classes[class];
        ClassStats {
            class,
            object_size: (class < NUM_FIXED_CLASSES).then(|| class_object_size(class)),
            free_arenas: sc.free.len(),
            full_arenas: sc.full.len(),
            size: sc.size,
            size_limit: sc.size_limit,
        }
    }

    /// Occupancy snapshot of arena `id`.
    #[must_use]
    pub fn arena_info(&self, id: ArenaId) -> ArenaInfo {
        ArenaInfo::of(self.arena(id))
    }
}

impl fmt::Debug for SizeClassHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeClassHeap")
            .field("classes", &self.classes)
            .field("arenas", &self.num_arenas())
            .finish_non_exhaustive()
    }
}

impl Drop for SizeClassHeap {
    fn drop(&mut self) {
        self.release_all();
    }
}
