//! Sweep phase: rebuild free lists, release empty arenas, rebalance lists.

use crate::arena::ArenaId;
use crate::gc::heuristic::HeapPolicy;
use crate::heap::{SizeClassHeap, LARGE_CLASS, NUM_CLASSES, NUM_FIXED_CLASSES};

/// Totals of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Live objects found in swept arenas.
    pub live: usize,
    /// Objects reclaimed.
    pub reclaimed: usize,
    /// Arenas unmapped.
    pub released: usize,
}

/// Sweeps every class.
///
/// Free-list arenas are always swept. Full-list arenas are swept on a full
/// collection, or when they were not dense at their previous sweep; those
/// that come out below the density threshold move to the free list. Any
/// swept arena left without a live object is released. The large class is
/// skipped on partial collections until its countdown expires.
///
/// Callers must have drained the mark stack: no object may be GREY.
pub fn sweep(
    heap: &mut SizeClassHeap,
    policy: &mut HeapPolicy,
    freelist_virgin_threshold: f64,
    full: bool,
) -> SweepStats {
    let mut stats = SweepStats::default();
    for class in 0..NUM_CLASSES {
        if class == LARGE_CLASS && !policy.check_release_large() && !full {
            continue;
        }
        sweep_class(heap, policy, class, freelist_virgin_threshold, full, &mut stats);
        if class < NUM_FIXED_CLASSES {
            policy.try_shrink_heap(class, heap.class_mut(class));
        }
    }
    stats
}

fn sweep_class(
    heap: &mut SizeClassHeap,
    policy: &HeapPolicy,
    class: usize,
    freelist_virgin_threshold: f64,
    full: bool,
    stats: &mut SweepStats,
) {
    let free = std::mem::take(&mut heap.class_mut(class).free);
    let full_list = std::mem::take(&mut heap.class_mut(class).full);

    // Arenas promoted from the full list go to the tail, behind the arenas
    // that were already free.
    let mut new_free: Vec<ArenaId> = Vec::with_capacity(free.len());
    let mut kept_free: Vec<ArenaId> = Vec::with_capacity(free.len());
    let mut new_full: Vec<ArenaId> = Vec::with_capacity(full_list.len());

    for id in free {
        let arena = heap.arena_mut(id);
        let swept = arena.sweep(freelist_virgin_threshold);
        policy.sweeping_done(arena);
        stats.live += swept.live;
        stats.reclaimed += swept.reclaimed;
        if swept.live == 0 {
            heap.release(id);
            stats.released += 1;
        } else {
            kept_free.push(id);
        }
    }

    for id in full_list {
        let arena = heap.arena_mut(id);
        if !full && !HeapPolicy::is_sweeping_candidate(arena) {
            new_full.push(id);
            continue;
        }
        let swept = arena.sweep(freelist_virgin_threshold);
        policy.sweeping_done(arena);
        stats.live += swept.live;
        stats.reclaimed += swept.reclaimed;
        if swept.live == 0 {
            heap.release(id);
            stats.released += 1;
        } else if policy.is_considered_full(arena) {
            new_full.push(id);
        } else {
            new_free.push(id);
        }
    }

    new_free.extend(kept_free);
    let sc = heap.class_mut(class);
    sc.free = new_free;
    sc.full = new_full;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{mark_byte, Color};
    use crate::config::GcConfig;

    fn blacken(addr: usize) {
        unsafe { mark_byte(addr as *const u8).write(Color::Black as u8) };
    }

    fn setup() -> (SizeClassHeap, HeapPolicy) {
        let config = GcConfig::default();
        (SizeClassHeap::new(4), HeapPolicy::new(&config))
    }

    #[test]
    fn empty_arenas_are_released() {
        let (mut heap, mut policy) = setup();
        for _ in 0..100 {
            heap.alloc_in_class(0, 32, true).unwrap();
        }
        assert_eq!(heap.num_arenas(), 1);

        let stats = sweep(&mut heap, &mut policy, 0.8, true);
        assert_eq!(stats, SweepStats { live: 0, reclaimed: 100, released: 1 });
        assert_eq!(heap.num_arenas(), 0);
        assert_eq!(heap.class_stats(0).free_arenas, 0);
    }

    #[test]
    fn sparse_full_arena_moves_back_to_free_list() {
        let (mut heap, mut policy) = setup();
        let class = NUM_FIXED_CLASSES - 1;
        let keep = heap.alloc_in_class(class, 4096, true).unwrap().as_ptr() as usize;
        while heap.alloc_in_class(class, 4096, false).is_ok() {}
        assert_eq!(heap.class_stats(class).full_arenas, 1);

        blacken(keep);
        let stats = sweep(&mut heap, &mut policy, 0.8, false);
        assert_eq!(stats.live, 1);
        let cs = heap.class_stats(class);
        assert_eq!((cs.free_arenas, cs.full_arenas), (1, 0));
    }

    #[test]
    fn dense_arena_is_skipped_by_partial_sweeps() {
        let (mut heap, mut policy) = setup();
        let class = NUM_FIXED_CLASSES - 1;
        let first = heap.alloc_in_class(class, 4096, true).unwrap().as_ptr() as usize;
        blacken(first);
        while let Ok(obj) = heap.alloc_in_class(class, 4096, false) {
            blacken(obj.as_ptr() as usize);
        }
        let id = heap.class(class).full[0];

        // A full sweep finds it dense and keeps it on the full list.
        let stats = sweep(&mut heap, &mut policy, 0.8, true);
        assert_eq!(stats.reclaimed, 0);
        assert!(heap.arena(id).was_full());
        assert_eq!(heap.class_stats(class).full_arenas, 1);

        // With every mark cleared a partial sweep would free everything, but
        // it does not look at the arena at all.
        heap.arena_mut(id).clear_marks();
        let stats = sweep(&mut heap, &mut policy, 0.8, false);
        assert_eq!(stats.reclaimed, 0);
        assert_eq!(heap.num_arenas(), 1);

        let stats = sweep(&mut heap, &mut policy, 0.8, true);
        assert_eq!(stats.released, 1);
        assert_eq!(heap.num_arenas(), 0);
    }

    #[test]
    fn large_class_waits_for_its_countdown_on_partial_sweeps() {
        let config = GcConfig::default().with_release_large_interval(1);
        let mut heap = SizeClassHeap::new(4);
        let mut policy = HeapPolicy::new(&config);
        heap.alloc_in_class(LARGE_CLASS, 64 * 1024, true).unwrap();

        assert_eq!(sweep(&mut heap, &mut policy, 0.8, false).released, 0);
        assert_eq!(sweep(&mut heap, &mut policy, 0.8, false).released, 1);
        assert_eq!(heap.class(LARGE_CLASS).size(), 0);
    }
}
