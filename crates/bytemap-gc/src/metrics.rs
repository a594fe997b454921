//! GC metrics and heap statistics.

use std::fmt;
use std::time::{Duration, Instant};

use crate::arena::{Arena, Color};

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the last collection.
    pub duration: Duration,
    /// Duration of the clear phase (zero for partial collections).
    pub clear_duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Objects blackened since the previous collection, by the background
    /// marker or the final drain.
    pub objects_marked: usize,
    /// Objects reclaimed by the sweep.
    pub objects_reclaimed: usize,
    /// Objects found live in swept arenas.
    pub objects_surviving: usize,
    /// Arenas unmapped because they held no live object.
    pub arenas_released: usize,
    /// Type of collection.
    pub collection_type: CollectionType,
    /// Collections performed by this heap so far, including this one.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            clear_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            objects_marked: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            arenas_released: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
        }
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Reuses prior marks; traces only from roots and re-greyed parents.
    Partial = 1,
    /// Clears every bytemap and recomputes reachability.
    Full = 2,
}

impl CollectionType {
    /// Label used in tracing spans.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

/// Internal helper for capturing phase durations.
///
/// ```
/// use bytemap_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... clear phase work ...
/// timer.end_clear();
///
/// timer.start();
/// // ... mark phase work ...
/// timer.end_mark();
///
/// timer.start();
/// // ... sweep phase work ...
/// timer.end_sweep();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Clear phase time.
    pub clear: Duration,
    /// Mark phase time.
    pub mark: Duration,
    /// Sweep phase time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clear: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the clear phase and record its duration.
    pub fn end_clear(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.clear = start.elapsed();
        }
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// Sum of the recorded phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.clear + self.mark + self.sweep
    }
}

/// Aggregate heap footprint, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    /// Bytes mapped from the OS for arenas.
    pub reserved: usize,
    /// Bytes of object capacity in those arenas.
    pub usable: usize,
    /// Bytes occupied by allocated objects.
    pub used: usize,
}

impl fmt::Display for MemoryStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: usize = 1 << 20;
        write!(
            f,
            "Reserved: {} mb | Usable: {} mb | Used: {} mb",
            self.reserved / MIB,
            self.usable / MIB,
            self.used / MIB
        )
    }
}

/// Arena list state of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// Class index.
    pub class: usize,
    /// Object size, `None` for the large class.
    pub object_size: Option<usize>,
    /// Arenas on the free list.
    pub free_arenas: usize,
    /// Arenas on the full list.
    pub full_arenas: usize,
    /// Arenas owned.
    pub size: usize,
    /// Arena limit before allocation collects.
    pub size_limit: usize,
}

/// Occupancy snapshot of one arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaInfo {
    /// Aligned region base.
    pub base: usize,
    /// Size class.
    pub class: usize,
    /// Bytes per object.
    pub object_size: usize,
    /// Object capacity.
    pub num_objects: usize,
    /// Live objects as of the last sweep plus allocations since.
    pub num_alloc: usize,
    /// Non-WHITE mark bytes.
    pub marked: usize,
    /// Non-WHITE marks per 512-object bucket.
    pub buckets: Vec<usize>,
}

const BUCKET: usize = 512;

impl ArenaInfo {
    pub(crate) fn of(arena: &Arena) -> Self {
        let h = arena.header();
        let mut buckets = vec![0; h.num_objects().div_ceil(BUCKET)];
        for i in 0..h.num_objects() {
            if arena.mark_at(i) != Color::White {
                buckets[i / BUCKET] += 1;
            }
        }
        Self {
            base: arena.base(),
            class: h.class(),
            object_size: h.object_size(),
            num_objects: h.num_objects(),
            num_alloc: arena.num_alloc(),
            marked: buckets.iter().sum(),
            buckets,
        }
    }
}

impl fmt::Display for ArenaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Arena : {:#x} = {{", self.base)?;
        writeln!(f, "  object_size  : {}", self.object_size)?;
        writeln!(f, "  num_objects  : {}", self.num_objects)?;
        write!(f, "  mark_bits    : [")?;
        for (i, count) in self.buckets.iter().enumerate() {
            if i > 0 && i % 24 == 0 {
                write!(f, "\n                  ")?;
            }
            write!(f, "{count:4}")?;
        }
        writeln!(f, "] ({})", self.marked)?;
        write!(f, "}}")
    }
}
