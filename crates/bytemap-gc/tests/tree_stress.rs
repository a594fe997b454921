//! Randomised tree workload: build trees under a shared root, prune random
//! edges, collect, and check that everything still reachable is intact.
//!
//! Every node stores its parent in slot 0 and the round that built it in its
//! tag, so corruption or premature reclamation shows up on the final walk.

use bytemap_gc::{GcConfig, GcHeap, ObjectRef};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const SEED: u64 = 90;
const ROUNDS: usize = 10;
const DEPTH: usize = 5;
const MAX_CHILDREN: usize = 4;
const PRUNE_PROBABILITY: f64 = 0.1;
const LARGE_LEAF_PROBABILITY: f64 = 0.02;
const LARGE_LEAF_LENGTH: usize = 600;

fn alloc_node(
    heap: &mut GcHeap,
    rng: &mut SmallRng,
    parent: ObjectRef,
    depth: usize,
    round: u32,
) -> ObjectRef {
    let length = if depth < DEPTH {
        rng.gen_range(1..=MAX_CHILDREN) + 1
    } else if rng.gen_bool(LARGE_LEAF_PROBABILITY) {
        LARGE_LEAF_LENGTH
    } else {
        1
    };
    let node = heap.alloc(length);
    heap.set_tag(node, round);
    heap.set_slot(node, 0, parent);
    node
}

/// Fills the child slots of `node`, which must already be reachable.
fn grow(heap: &mut GcHeap, rng: &mut SmallRng, node: ObjectRef, depth: usize, round: u32) {
    if depth == DEPTH {
        return;
    }
    for i in 1..heap.length(node) {
        let child = alloc_node(heap, rng, node, depth + 1, round);
        heap.set_slot(node, i, child);
        grow(heap, rng, child, depth + 1, round);
    }
}

fn prune(heap: &GcHeap, rng: &mut SmallRng, root: ObjectRef, built: usize) {
    let nil = heap.nil();
    let mut pending: Vec<(ObjectRef, usize)> = (0..built)
        .map(|round| (heap.get_slot(root, round), 0))
        .collect();
    while let Some((node, depth)) = pending.pop() {
        if depth == DEPTH {
            continue;
        }
        for i in 1..heap.length(node) {
            let child = heap.get_slot(node, i);
            if child == nil {
                continue;
            }
            if rng.gen_bool(PRUNE_PROBABILITY) {
                heap.set_slot(node, i, nil);
            } else {
                pending.push((child, depth + 1));
            }
        }
    }
}

/// Walks every tree, asserting tags and back-pointers. Returns the node count.
fn check(heap: &GcHeap, root: ObjectRef) -> usize {
    let nil = heap.nil();
    let mut count = 0;
    for round in 0..ROUNDS {
        let tree = heap.get_slot(root, round);
        let mut pending = vec![(tree, root, 0)];
        while let Some((node, parent, depth)) = pending.pop() {
            count += 1;
            assert_eq!(heap.tag(node) as usize, round, "tag of {node:?}");
            assert_eq!(heap.get_slot(node, 0), parent, "back-pointer of {node:?}");
            if depth == DEPTH {
                continue;
            }
            for i in 1..heap.length(node) {
                let child = heap.get_slot(node, i);
                if child != nil {
                    pending.push((child, node, depth + 1));
                }
            }
        }
    }
    count
}

fn run(config: GcConfig) {
    let mut heap = GcHeap::new(config).unwrap();
    let mut rng = SmallRng::seed_from_u64(SEED);
    let root = heap.alloc(ROUNDS);
    heap.add_root(root);

    for round in 0..ROUNDS {
        let tag = u32::try_from(round).unwrap();
        let tree = alloc_node(&mut heap, &mut rng, root, 0, tag);
        heap.set_slot(root, round, tree);
        grow(&mut heap, &mut rng, tree, 0, tag);

        prune(&heap, &mut rng, root, round + 1);
        heap.collect(round % 3 == 2);
    }

    let nodes = check(&heap, root);
    heap.collect(true);
    assert_eq!(check(&heap, root), nodes);
    // The trees, the shared root and nil.
    assert_eq!(heap.last_gc_metrics().objects_surviving, nodes + 2);
    assert!(heap.verify().is_ok());
}

#[test]
fn test_tree_workload() {
    run(GcConfig::default()
        .with_initial_arenas_per_class(1)
        .with_verify_heap(true));
}

#[test]
fn test_tree_workload_with_frequent_full_collections() {
    run(GcConfig::default()
        .with_initial_arenas_per_class(1)
        .with_full_gc_interval(1)
        .with_release_large_interval(0));
}

#[test]
fn test_tree_workload_with_concurrent_marker() {
    run(GcConfig::default()
        .with_initial_arenas_per_class(1)
        .with_concurrent_marking(true)
        .with_marker_batch_size(16)
        .with_verify_heap(true));
}
