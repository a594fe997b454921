//! Basic allocation, slot access and collection tests for bytemap-gc.

use bytemap_gc::{Color, GcConfig, GcError, GcHeap, ObjectRef};

fn heap() -> GcHeap {
    GcHeap::new(GcConfig::default().with_verify_heap(true)).unwrap()
}

#[test]
fn test_basic_allocation() {
    let mut heap = heap();
    let obj = heap.alloc(3);
    assert_eq!(heap.length(obj), 3);
    assert_eq!(heap.tag(obj), 0);
    for i in 0..3 {
        assert_eq!(heap.get_slot(obj, i), heap.nil());
    }
}

#[test]
fn test_zero_length_objects_are_distinct() {
    let mut heap = heap();
    let a = heap.alloc(0);
    let b = heap.alloc(0);
    assert_ne!(a, b);
    assert_ne!(a, heap.nil());
    assert_eq!(heap.length(a), 0);
}

#[test]
fn test_set_and_get_slot() {
    let mut heap = heap();
    let parent = heap.alloc(2);
    let child = heap.alloc(1);
    heap.set_slot(parent, 1, child);
    assert_eq!(heap.get_slot(parent, 0), heap.nil());
    assert_eq!(heap.get_slot(parent, 1), child);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn test_set_slot_out_of_bounds_panics() {
    let mut heap = heap();
    let obj = heap.alloc(1);
    let nil = heap.nil();
    heap.set_slot(obj, 1, nil);
}

#[test]
fn test_tags_survive_collection() {
    let mut heap = heap();
    let obj = heap.alloc(1);
    heap.add_root(obj);
    heap.set_tag(obj, 0x7fff_ffff);
    heap.collect(true);
    heap.collect(false);
    assert_eq!(heap.tag(obj), 0x7fff_ffff);
}

#[test]
#[should_panic(expected = "tag")]
fn test_oversized_tag_panics() {
    let mut heap = heap();
    let obj = heap.alloc(0);
    heap.set_tag(obj, 1 << 31);
}

#[test]
fn test_reachable_graph_survives() {
    let mut heap = heap();
    let root = heap.alloc(2);
    heap.add_root(root);
    let left = heap.alloc(1);
    let right = heap.alloc(1);
    heap.set_slot(root, 0, left);
    heap.set_slot(root, 1, right);
    let leaf = heap.alloc(0);
    heap.set_slot(left, 0, leaf);
    heap.set_slot(right, 0, leaf);

    heap.collect(true);

    for obj in [root, left, right, leaf, heap.nil()] {
        assert_eq!(heap.mark_of(obj), Color::Black);
        assert!(heap.is_old(obj));
    }
    assert_eq!(heap.get_slot(heap.get_slot(root, 1), 0), leaf);
}

#[test]
fn test_unreachable_objects_are_reclaimed() {
    let mut heap = heap();
    let root = heap.alloc(1);
    heap.add_root(root);
    for _ in 0..1000 {
        heap.alloc(2);
    }
    heap.collect(true);
    let metrics = heap.last_gc_metrics();
    assert_eq!(metrics.objects_reclaimed, 1000);
    assert_eq!(metrics.objects_surviving, 2);
}

#[test]
fn test_cycles_are_collected() {
    let mut heap = heap();
    let a = heap.alloc(1);
    let b = heap.alloc(1);
    heap.set_slot(a, 0, b);
    heap.set_slot(b, 0, a);
    heap.collect(true);
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 2);
}

#[test]
fn test_removed_root_is_reclaimed_by_full_collection() {
    let mut heap = heap();
    let root = heap.alloc(0);
    heap.add_root(root);
    heap.collect(true);
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 0);

    assert!(heap.remove_root(root));
    heap.collect(true);
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 1);
}

#[test]
fn test_partial_collection_keeps_old_objects() {
    let mut heap = heap();
    let root = heap.alloc(1);
    heap.add_root(root);
    let old = heap.alloc(0);
    heap.set_slot(root, 0, old);
    heap.collect(true);

    // Detaching an old object does not free it until the next full cycle.
    let nil = heap.nil();
    heap.set_slot(root, 0, nil);
    heap.collect(false);
    assert_eq!(heap.mark_of(old), Color::Black);
    heap.collect(true);
    assert_eq!(heap.last_gc_metrics().objects_reclaimed, 1);
}

#[test]
fn test_young_child_of_old_parent_survives_partial_collection() {
    let mut heap = heap();
    let parent = heap.alloc(1);
    heap.add_root(parent);
    heap.collect(true);

    let child = heap.alloc(1);
    heap.set_slot(parent, 0, child);
    let grandchild = heap.alloc(0);
    heap.set_slot(child, 0, grandchild);

    heap.collect(false);
    assert_eq!(heap.mark_of(child), Color::Black);
    assert_eq!(heap.mark_of(grandchild), Color::Black);
    assert!(heap.verify().is_ok());
}

#[test]
fn test_freed_slots_are_reused() {
    let mut heap = heap();
    let first: Vec<ObjectRef> = (0..10).map(|_| heap.alloc(1)).collect();
    heap.collect(true);
    let second: Vec<ObjectRef> = (0..10).map(|_| heap.alloc(1)).collect();
    assert!(second.iter().all(|obj| heap.owns(*obj)));
    // Nil keeps the class 0 arena alive and its free list is reused.
    assert_eq!(heap.num_arenas(), 1);
    drop(first);
}

#[test]
fn test_invalid_config_is_reported() {
    let err = GcHeap::new(GcConfig::default().with_arena_full_ratio(1.5)).unwrap_err();
    assert!(matches!(err, GcError::InvalidConfig(_)));
    assert!(err.to_string().starts_with("invalid GC configuration"));
}

#[test]
fn test_teardown_with_live_roots() {
    let mut heap = heap();
    let root = heap.alloc(8);
    heap.add_root(root);
    for i in 0..8 {
        let child = heap.alloc(i);
        heap.set_slot(root, i, child);
    }
    heap.teardown();
}

#[test]
fn test_reclaimed_objects_are_not_owned() {
    let mut heap = heap();
    let root = heap.alloc(1);
    heap.add_root(root);
    let garbage = heap.alloc(1);
    let kept = heap.alloc(1);
    heap.set_slot(root, 0, kept);
    let big = heap.alloc(600);
    assert!(heap.owns(garbage) && heap.owns(big));

    heap.collect(true);
    assert!(!heap.owns(garbage));
    assert!(!heap.owns(big));
    assert!(heap.owns(kept));
    assert!(heap.arena_info(big).is_none());
}

#[test]
#[should_panic(expected = "is not a live object of this heap")]
fn test_reading_a_released_large_object_panics() {
    let mut heap = heap();
    let big = heap.alloc(600);
    heap.collect(true);
    let _ = heap.length(big);
}

#[test]
#[should_panic(expected = "is not a live object of this heap")]
fn test_storing_a_reclaimed_object_panics() {
    let mut heap = heap();
    let root = heap.alloc(1);
    heap.add_root(root);
    let garbage = heap.alloc(0);
    heap.collect(true);
    heap.set_slot(root, 0, garbage);
}
