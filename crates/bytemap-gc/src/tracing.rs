//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for garbage collection operations.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// High-level GC phases (clear/mark/sweep).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Reset every bytemap (full collections only).
        Clear,
        /// Grey the roots and drain the mark stack.
        Mark,
        /// Rebuild free lists and release empty arenas.
        Sweep,
    }

    /// Stable identifier for a GC run.
    ///
    /// Correlates all events of a single collection. Monotonically
    /// increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for a GC phase (clear/mark/sweep).
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end of a GC phase with the number of objects it touched.
    pub fn log_phase_end(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }

    /// Log a heap limit change of one size class.
    pub fn log_limit_change(class: usize, from: usize, to: usize, in_use: usize) {
        tracing::debug!(class, from, to, in_use, "heap_limit");
    }

    /// Log an allocation that exhausted the whole escalation ladder.
    pub fn log_exhausted(length: usize, class: usize) {
        tracing::error!(length, class, "allocation_exhausted");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    #[allow(dead_code)]
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
