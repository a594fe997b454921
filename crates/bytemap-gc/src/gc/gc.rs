//! The collector handle: allocation ladder, roots, slot access and the
//! collection cycle.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use crate::arena::{Color, ARENA_SIZE};
use crate::config::GcConfig;
use crate::error::GcError;
use crate::gc::heuristic::HeapPolicy;
use crate::gc::mark::{color_of, MarkState};
use crate::gc::mark_stack::MarkStack;
use crate::gc::marker::{MarkShared, MarkerThread};
use crate::gc::sweep::sweep;
use crate::gc::verify::{verify_heap, VerifyError};
use crate::heap::{AllocFailure, SizeClassHeap, LARGE_CLASS, NUM_CLASSES};
use crate::metrics::{ArenaInfo, ClassStats, CollectionType, GcMetrics, MemoryStatistics, PhaseTimer};
use crate::object::{checked_object_length_to_size, ObjectRef, HEADER_SIZE};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_exhausted, log_phase_end, next_gc_id, trace_gc_collection, trace_phase, GcPhase,
};

/// A garbage-collected heap of slot-array objects.
///
/// Objects are reachable from the root set or from `Nil`, which is always
/// live. An [`ObjectRef`] to an object that was not reachable at a
/// collection is stale afterwards: every accessor taking one panics unless
/// [`GcHeap::owns`] holds. Hosts keep what they use rooted.
///
/// ```
/// use bytemap_gc::GcHeap;
///
/// let mut heap = GcHeap::with_defaults().unwrap();
/// let root = heap.alloc(2);
/// heap.add_root(root);
///
/// let child = heap.alloc(0);
/// heap.set_slot(root, 0, child);
/// heap.collect(true);
///
/// assert_eq!(heap.get_slot(root, 0), child);
/// assert_eq!(heap.get_slot(root, 1), heap.nil());
/// ```
pub struct GcHeap {
    heap: SizeClassHeap,
    policy: HeapPolicy,
    shared: Arc<MarkShared>,
    marker: Option<MarkerThread>,
    roots: Vec<ObjectRef>,
    nil: ObjectRef,
    config: GcConfig,
    last_metrics: GcMetrics,
    total_collections: usize,
    torn_down: bool,
}

const fn region_len(class: usize, size: usize) -> usize {
    if class == LARGE_CLASS {
        size
    } else {
        ARENA_SIZE
    }
}

impl GcHeap {
    /// Builds a heap: validates `config`, maps the mark stack's scratch
    /// space, allocates `Nil` and, if configured, starts the background
    /// marker.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidConfig`] for a bad configuration, otherwise the
    /// error of the first resource that could not be acquired.
    pub fn new(config: GcConfig) -> Result<Self, GcError> {
        config.validate().map_err(GcError::InvalidConfig)?;

        let mut heap = SizeClassHeap::new(config.initial_arenas_per_class);
        let stack = MarkStack::new(config.scratch_space_size)?;

        let class = heap.class_for_length(0);
        let raw = heap
            .alloc_in_class(class, HEADER_SIZE, true)
            .map_err(|failure| match failure {
                AllocFailure::Map(source) => GcError::RegionMap {
                    len: ARENA_SIZE,
                    source,
                },
                AllocFailure::Exhausted => GcError::OutOfMemory { length: 0, class },
            })?;
        // SAFETY: fresh arena storage for a zero-length object.
        let nil = unsafe { ObjectRef::init(raw, 0, None) };

        let shared = Arc::new(MarkShared::new(MarkState::new(stack)));
        let marker = if config.concurrent_marking {
            Some(
                MarkerThread::spawn(Arc::clone(&shared), config.marker_batch_size)
                    .map_err(GcError::MarkerSpawn)?,
            )
        } else {
            None
        };

        Ok(Self {
            heap,
            policy: HeapPolicy::new(&config),
            shared,
            marker,
            roots: Vec::new(),
            nil,
            config,
            last_metrics: GcMetrics::new(),
            total_collections: 0,
            torn_down: false,
        })
    }

    /// [`GcHeap::new`] with [`GcConfig::default`].
    ///
    /// # Errors
    ///
    /// See [`GcHeap::new`].
    pub fn with_defaults() -> Result<Self, GcError> {
        Self::new(GcConfig::default())
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The shared empty object every fresh slot points to.
    #[must_use]
    pub const fn nil(&self) -> ObjectRef {
        self.nil
    }

    /// Allocates an object with `length` slots, all set to [`GcHeap::nil`].
    ///
    /// # Panics
    ///
    /// Panics when memory cannot be obtained even after collecting and
    /// growing the heap; see [`GcHeap::try_alloc`].
    pub fn alloc(&mut self, length: usize) -> ObjectRef {
        self.try_alloc(length).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Allocates an object with `length` slots, all set to [`GcHeap::nil`].
    ///
    /// Escalates until something fits: allocate (mapping a new arena while
    /// the class is under its limit), collect (full when due), retry, raise
    /// the class limit, retry, collect fully, retry.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] when every step failed for lack of room or
    /// the object size does not fit in a `usize`, [`GcError::RegionMap`]
    /// when the last step failed because the OS refused a new arena.
    pub fn try_alloc(&mut self, length: usize) -> Result<ObjectRef, GcError> {
        let class = self.heap.class_for_length(length);
        let Some(size) = checked_object_length_to_size(length) else {
            #[cfg(feature = "tracing")]
            log_exhausted(length, LARGE_CLASS);
            return Err(GcError::OutOfMemory {
                length,
                class: LARGE_CLASS,
            });
        };
        let raw = self.alloc_raw(class, size).map_err(|failure| {
            #[cfg(feature = "tracing")]
            log_exhausted(length, class);
            match failure {
                AllocFailure::Exhausted => GcError::OutOfMemory { length, class },
                AllocFailure::Map(source) => GcError::RegionMap {
                    len: region_len(class, size),
                    source,
                },
            }
        })?;
        // SAFETY: `raw` is fresh storage of at least `size` bytes.
        Ok(unsafe { ObjectRef::init(raw, length, Some(self.nil)) })
    }

    fn alloc_raw(&mut self, class: usize, size: usize) -> Result<NonNull<u8>, AllocFailure> {
        let grow = self.heap.class(class).can_grow();
        if let Ok(raw) = self.heap.alloc_in_class(class, size, grow) {
            return Ok(raw);
        }

        self.collect(self.policy.is_full_gc_due());
        if let Ok(raw) = self.heap.alloc_in_class(class, size, false) {
            return Ok(raw);
        }

        self.policy.grow_heap(class, self.heap.class_mut(class));
        if let Ok(raw) = self.heap.alloc_in_class(class, size, true) {
            return Ok(raw);
        }

        self.collect(true);
        self.heap.alloc_in_class(class, size, true)
    }

    /// Number of slots of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap.
    #[must_use]
    pub fn length(&self, obj: ObjectRef) -> usize {
        self.check_live(obj);
        obj.length()
    }

    /// Reads slot `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap or `index` is out
    /// of bounds.
    #[must_use]
    pub fn get_slot(&self, obj: ObjectRef, index: usize) -> ObjectRef {
        self.check_live(obj);
        Self::check_index(obj, index);
        // SAFETY: bounds checked above.
        unsafe { obj.slot_unchecked(index) }
    }

    /// Stores `value` into slot `index` of `obj`, running the write barrier.
    ///
    /// # Panics
    ///
    /// Panics if either object is not a live object of this heap or `index`
    /// is out of bounds.
    pub fn set_slot(&self, obj: ObjectRef, index: usize, value: ObjectRef) {
        self.check_live(obj);
        self.check_live(value);
        Self::check_index(obj, index);
        let mut state = self.shared.lock_for_write();
        // SAFETY: bounds checked; the barrier runs under the same lock.
        let pushed = unsafe {
            obj.store_slot_unchecked(index, value);
            state.write_barrier(obj, value)
        };
        drop(state);
        if pushed {
            self.wake_marker();
        }
    }

    /// Runs the write barrier for a store of `child` into `parent` that the
    /// host performed itself, e.g. through
    /// [`ObjectRef::store_slot_unchecked`].
    ///
    /// # Panics
    ///
    /// Panics if either object is not a live object of this heap.
    pub fn write_barrier(&self, parent: ObjectRef, child: ObjectRef) {
        self.check_live(parent);
        self.check_live(child);
        let mut state = self.shared.lock_for_write();
        // SAFETY: both objects belong to this heap.
        let pushed = unsafe { state.write_barrier(parent, child) };
        drop(state);
        if pushed {
            self.wake_marker();
        }
    }

    fn check_live(&self, obj: ObjectRef) {
        assert!(self.owns(obj), "{obj:?} is not a live object of this heap");
    }

    fn check_index(obj: ObjectRef, index: usize) {
        let length = obj.length();
        assert!(
            index < length,
            "slot index {index} out of bounds for object of length {length}"
        );
    }

    fn wake_marker(&self) {
        if self.marker.is_some() {
            self.shared.notify_work();
        }
    }

    /// The 31-bit user tag of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap.
    #[must_use]
    pub fn tag(&self, obj: ObjectRef) -> u32 {
        self.check_live(obj);
        obj.tag()
    }

    /// Replaces the user tag of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap or `tag` does not
    /// fit in 31 bits.
    pub fn set_tag(&self, obj: ObjectRef, tag: u32) {
        self.check_live(obj);
        obj.set_tag(tag);
    }

    /// Whether `obj` survived a mark phase.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap.
    #[must_use]
    pub fn is_old(&self, obj: ObjectRef) -> bool {
        self.check_live(obj);
        obj.is_old()
    }

    /// Whether `obj` is a live object of this heap: it starts an object slot
    /// in one of the arenas, and no sweep has reclaimed that slot since it
    /// was allocated.
    ///
    /// A stale reference whose slot was reused by a later allocation refers
    /// to the new object.
    #[must_use]
    pub fn owns(&self, obj: ObjectRef) -> bool {
        self.heap.holds_object(obj.addr())
    }

    /// Adds `obj` to the root set. Adding a root twice requires removing it
    /// twice.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap.
    pub fn add_root(&mut self, obj: ObjectRef) {
        self.check_live(obj);
        self.roots.push(obj);
        let mut state = self.shared.lock_for_write();
        // SAFETY: `obj` belongs to this heap.
        let pushed = unsafe { state.shade(obj) };
        drop(state);
        if pushed {
            self.wake_marker();
        }
    }

    /// Removes one occurrence of `obj` from the root set.
    pub fn remove_root(&mut self, obj: ObjectRef) -> bool {
        let Some(pos) = self.roots.iter().position(|&root| root == obj) else {
            return false;
        };
        self.roots.remove(pos);
        true
    }

    /// The registered roots. `Nil` is implicit and never listed.
    #[must_use]
    pub fn roots(&self) -> &[ObjectRef] {
        &self.roots
    }

    /// Runs a collection.
    ///
    /// A full collection resets every bytemap first and so recomputes
    /// reachability from scratch. A partial one keeps the marks of the
    /// previous cycle: objects that were BLACK stay BLACK unless the write
    /// barrier re-greyed them, and dense arenas are not swept.
    pub fn collect(&mut self, full: bool) {
        let collection_type = if full {
            CollectionType::Full
        } else {
            CollectionType::Partial
        };
        #[cfg(feature = "tracing")]
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection(collection_type.as_str(), gc_id);

        let start = Instant::now();
        let mut timer = PhaseTimer::new();
        let mut state = self.shared.pause();

        if self.config.verify_heap {
            // SAFETY: the mark lock is held.
            if let Err(err) = unsafe { verify_heap(&self.heap) } {
                panic!("heap verification failed before collection: {err}");
            }
        }

        if full {
            #[cfg(feature = "tracing")]
            let _clear_span = trace_phase(GcPhase::Clear);
            timer.start();
            state.stack.reset();
            for arena in self.heap.arenas_mut() {
                arena.clear_marks();
            }
            timer.end_clear();
        }

        let objects_marked = {
            #[cfg(feature = "tracing")]
            let _mark_span = trace_phase(GcPhase::Mark);
            timer.start();
            // SAFETY: roots and Nil are live objects of this heap, and the
            // lock is held for the whole drain.
            unsafe {
                state.shade(self.nil);
                for &root in &self.roots {
                    state.shade(root);
                }
                state.drain();
            }
            let marked = state.take_marked();
            timer.end_mark();
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Mark, marked);
            marked
        };

        let swept = {
            #[cfg(feature = "tracing")]
            let _sweep_span = trace_phase(GcPhase::Sweep);
            timer.start();
            let swept = sweep(
                &mut self.heap,
                &mut self.policy,
                self.config.freelist_virgin_threshold,
                full,
            );
            state.stack.reset();
            timer.end_sweep();
            #[cfg(feature = "tracing")]
            log_phase_end(GcPhase::Sweep, swept.reclaimed);
            swept
        };

        if self.config.verify_heap {
            // SAFETY: the mark lock is still held.
            if let Err(err) = unsafe { verify_heap(&self.heap) } {
                panic!("heap verification failed after collection: {err}");
            }
        }

        self.shared.resume(state);
        if full {
            self.policy.full_gc_done();
        }

        self.total_collections += 1;
        self.last_metrics = GcMetrics {
            duration: start.elapsed(),
            clear_duration: timer.clear,
            mark_duration: timer.mark,
            sweep_duration: timer.sweep,
            objects_marked,
            objects_reclaimed: swept.reclaimed,
            objects_surviving: swept.live,
            arenas_released: swept.released,
            collection_type,
            total_collections: self.total_collections,
        };
    }

    /// Checks the heap invariants, pausing the background marker meanwhile.
    ///
    /// # Errors
    ///
    /// The first violation found.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let guard = self.shared.pause();
        // SAFETY: the mark lock is held.
        let result = unsafe { verify_heap(&self.heap) };
        self.shared.resume(guard);
        result
    }

    /// Current mark of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object of this heap.
    #[must_use]
    pub fn mark_of(&self, obj: ObjectRef) -> Color {
        self.check_live(obj);
        let _guard = self.shared.lock();
        // SAFETY: `obj` belongs to this heap and the lock is held.
        unsafe { color_of(obj) }
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> GcMetrics {
        self.last_metrics
    }

    /// Collections run so far.
    #[must_use]
    pub const fn total_collections(&self) -> usize {
        self.total_collections
    }

    /// Aggregate reserved, usable and used bytes.
    #[must_use]
    pub fn memory_statistics(&self) -> MemoryStatistics {
        self.heap.memory_statistics()
    }

    /// Arena lists of size class `class`.
    ///
    /// # Panics
    ///
    /// Panics if `class` is not a valid class index.
    #[must_use]
    pub fn class_stats(&self, class: usize) -> ClassStats {
        assert!(class < NUM_CLASSES, "size class {class} does not exist");
        self.heap.class_stats(class)
    }

    /// Size class an object of `length` slots is allocated in.
    #[must_use]
    pub const fn class_for_length(&self, length: usize) -> usize {
        self.heap.class_for_length(length)
    }

    /// Number of mapped arenas.
    #[must_use]
    pub fn num_arenas(&self) -> usize {
        self.heap.num_arenas()
    }

    /// Occupancy and mark counts of the arena holding `obj`.
    #[must_use]
    pub fn arena_info(&self, obj: ObjectRef) -> Option<ArenaInfo> {
        let id = self.heap.arena_of(obj.addr())?;
        let _guard = self.shared.lock();
        Some(self.heap.arena_info(id))
    }

    /// Occupancy and mark counts of every arena.
    #[must_use]
    pub fn arena_infos(&self) -> Vec<ArenaInfo> {
        let _guard = self.shared.lock();
        self.heap.arenas().map(ArenaInfo::of).collect()
    }

    /// Whether a background marker thread is attached.
    #[must_use]
    pub fn has_marker(&self) -> bool {
        self.marker.as_ref().is_some_and(MarkerThread::is_running)
    }

    /// Stops the marker, runs a final full collection and unmaps every
    /// arena. Dropping the heap does the same.
    pub fn teardown(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(marker) = self.marker.as_mut() {
            marker.stop(&self.shared);
        }
        self.collect(true);
        self.roots.clear();
        self.heap.release_all();
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Some(marker) = self.marker.as_mut() {
                marker.stop(&self.shared);
            }
            return;
        }
        self.shutdown();
    }
}

impl std::fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeap")
            .field("heap", &self.heap)
            .field("roots", &self.roots.len())
            .field("marker", &self.marker)
            .field("total_collections", &self.total_collections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> GcHeap {
        GcHeap::new(GcConfig::default().with_verify_heap(true)).unwrap()
    }

    #[test]
    fn nil_is_permanent() {
        let mut heap = heap();
        let nil = heap.nil();
        heap.collect(true);
        heap.collect(false);
        assert_eq!(heap.mark_of(nil), Color::Black);
        assert_eq!(heap.length(nil), 0);
        assert!(heap.owns(nil));
    }

    #[test]
    fn fresh_slots_point_to_nil() {
        let mut heap = heap();
        let obj = heap.alloc(7);
        for i in 0..7 {
            assert_eq!(heap.get_slot(obj, i), heap.nil());
        }
        assert_eq!(heap.tag(obj), 0);
        assert!(!heap.is_old(obj));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn slot_access_is_bounds_checked() {
        let mut heap = heap();
        let obj = heap.alloc(2);
        let _ = heap.get_slot(obj, 2);
    }

    #[test]
    fn unrooted_objects_are_reclaimed_by_full_collection() {
        let mut heap = heap();
        let root = heap.alloc(1);
        heap.add_root(root);
        let kept = heap.alloc(0);
        heap.set_slot(root, 0, kept);
        for _ in 0..50 {
            heap.alloc(3);
        }

        heap.collect(true);
        let metrics = heap.last_gc_metrics();
        assert_eq!(metrics.collection_type, CollectionType::Full);
        assert_eq!(metrics.objects_reclaimed, 50);
        // nil, root, kept
        assert_eq!(metrics.objects_surviving, 3);
        assert_eq!(heap.mark_of(kept), Color::Black);
        assert!(heap.is_old(kept));
    }

    #[test]
    fn barrier_protects_young_child_of_old_parent() {
        let mut heap = heap();
        let parent = heap.alloc(1);
        heap.add_root(parent);
        heap.collect(true);
        assert_eq!(heap.mark_of(parent), Color::Black);

        // Bypass `set_slot`, then run the barrier by hand.
        let child = heap.alloc(0);
        unsafe { parent.store_slot_unchecked(0, child) };
        assert_eq!(heap.mark_of(child), Color::White);
        heap.write_barrier(parent, child);
        assert_eq!(heap.mark_of(parent), Color::Grey);

        heap.collect(false);
        assert_ne!(heap.mark_of(child), Color::White);
        assert_eq!(heap.get_slot(parent, 0), child);
    }

    #[test]
    fn remove_root_counts_occurrences() {
        let mut heap = heap();
        let a = heap.alloc(0);
        heap.add_root(a);
        heap.add_root(a);
        assert_eq!(heap.roots(), &[a, a]);
        assert!(heap.remove_root(a));
        assert!(heap.remove_root(a));
        assert!(!heap.remove_root(a));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = GcHeap::new(GcConfig::default().with_grow_factor(0.5)).unwrap_err();
        assert!(matches!(err, GcError::InvalidConfig(_)));
    }

    #[test]
    fn teardown_releases_everything() {
        let mut heap = heap();
        let root = heap.alloc(4);
        heap.add_root(root);
        heap.alloc(600);
        heap.teardown();
    }
}
