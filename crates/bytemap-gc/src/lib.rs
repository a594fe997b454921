//! A non-moving mark/sweep collector for slot-array objects.
//!
//! `bytemap-gc` manages objects made of a small header and a run of pointer
//! slots. Objects live in 1 MiB aligned **arenas**, each dedicated to one
//! size class, so any interior address finds its arena by masking off the
//! low bits. Every arena keeps a **bytemap**, one mark byte per object
//! slot, holding the tri-color state used by the collector.
//!
//! # Features
//!
//! - **Segregated size classes**: eight power-of-two classes from 32 to
//!   4096 bytes, plus a large class with one object per arena
//! - **Tri-color marking** with an incremental-update write barrier
//! - **Partial and full collections**: partial collections keep last cycle's
//!   marks and skip dense arenas; full ones recompute reachability
//! - **Self-sizing heap**: per-class arena limits grow under pressure and
//!   shrink after sweeps
//! - **Optional concurrent marking** on a background thread
//!
//! # Quick Start
//!
//! ```
//! use bytemap_gc::{GcConfig, GcHeap};
//!
//! let mut heap = GcHeap::new(GcConfig::default()).unwrap();
//!
//! // A two-element cycle hanging off a root.
//! let root = heap.alloc(1);
//! heap.add_root(root);
//! let a = heap.alloc(1);
//! let b = heap.alloc(1);
//! heap.set_slot(root, 0, a);
//! heap.set_slot(a, 0, b);
//! heap.set_slot(b, 0, a);
//!
//! heap.collect(true);
//! assert_eq!(heap.get_slot(heap.get_slot(a, 0), 0), a);
//!
//! // Cut the cycle loose; the next full collection reclaims it.
//! heap.set_slot(root, 0, heap.nil());
//! heap.collect(true);
//! assert_eq!(heap.last_gc_metrics().objects_reclaimed, 2);
//! ```
//!
//! # Thread Safety
//!
//! [`GcHeap`] and [`ObjectRef`] are `!Send` and `!Sync`: one mutator thread
//! owns the heap. With [`GcConfig::concurrent_marking`] set, a background
//! thread drains the mark stack between collections; it synchronises with
//! the mutator through the write barrier.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Arena layout, bytemaps and per-arena allocation.
///
/// Public for diagnostics and tests. Most users only need [`GcHeap`].
pub mod arena;
pub mod config;
pub mod error;
mod gc;
/// Size classes and the arena lists behind them.
pub mod heap;
pub mod metrics;
pub mod object;
mod tracing;

pub use arena::Color;
pub use config::GcConfig;
pub use error::GcError;
pub use gc::heuristic::HeapPolicy;
pub use gc::mark_stack::MarkStack;
pub use gc::verify::VerifyError;
pub use gc::GcHeap;
pub use metrics::{ArenaInfo, ClassStats, CollectionType, GcMetrics, MemoryStatistics};
pub use object::ObjectRef;
pub use tracing::GcId;
