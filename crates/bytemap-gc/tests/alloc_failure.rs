//! Allocation requests that cannot be satisfied.

use bytemap_gc::heap::LARGE_CLASS;
use bytemap_gc::{CollectionType, GcConfig, GcError, GcHeap};

fn tiny_heap() -> GcHeap {
    GcHeap::new(
        GcConfig::default()
            .with_initial_arenas_per_class(1)
            .with_verify_heap(true),
    )
    .unwrap()
}

#[test]
fn test_wrapping_length_is_out_of_memory() {
    let mut heap = tiny_heap();
    let before = heap.total_collections();

    let err = heap.try_alloc(1usize << 61).unwrap_err();
    assert!(matches!(
        err,
        GcError::OutOfMemory { length, class } if length == 1 << 61 && class == LARGE_CLASS
    ));
    assert_eq!(heap.total_collections(), before);

    let err = heap.try_alloc(usize::MAX).unwrap_err();
    assert!(matches!(err, GcError::OutOfMemory { .. }));

    // The heap is untouched and still serves requests.
    let obj = heap.alloc(3);
    assert_eq!(heap.length(obj), 3);
    assert!(heap.verify().is_ok());
}

#[test]
fn test_unmappable_request_collects_before_failing() {
    let mut heap = tiny_heap();
    let root = heap.alloc(1);
    heap.add_root(root);
    let kept = heap.alloc(2);
    heap.set_slot(root, 0, kept);
    for _ in 0..100 {
        heap.alloc(2);
    }
    let before = heap.total_collections();

    // Fits in a usize, but no address space can hold it.
    let err = heap.try_alloc(1usize << 58).unwrap_err();
    assert!(matches!(err, GcError::RegionMap { .. }), "{err}");
    assert!(std::error::Error::source(&err).is_some());

    // One collection after the first attempt, a full one before the last.
    assert_eq!(heap.total_collections(), before + 2);
    assert_eq!(
        heap.last_gc_metrics().collection_type,
        CollectionType::Full
    );
    assert_eq!(heap.get_slot(root, 0), kept);
    assert!(heap.verify().is_ok());
}

#[test]
#[should_panic(expected = "out of memory allocating an object of length")]
fn test_alloc_panics_with_the_error() {
    let mut heap = tiny_heap();
    heap.alloc(usize::MAX / 2);
}
