//! Collection machinery.
//!
//! - `mark_stack`: the grey-object stack, carved out of a fixed scratch region
//! - `mark`: tri-color marking over the arena bytemaps and the write barrier
//! - `marker`: the optional background marking thread and its lock handshake
//! - `sweep`: free-list rebuild, arena release and list rebalancing
//! - `heuristic`: heap growth, shrinking and full-collection scheduling
//! - `verify`: heap invariant checks

#[allow(clippy::module_inception)]
mod gc;

pub mod heuristic;
pub mod mark;
pub mod mark_stack;
pub mod marker;
pub mod sweep;
pub mod verify;

pub use gc::GcHeap;
