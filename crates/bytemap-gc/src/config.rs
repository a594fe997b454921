//! Collector tuning knobs.

use crate::gc::mark_stack::StackChunk;

/// Default arena limit of every size class at start-up.
pub const DEFAULT_INITIAL_ARENAS: usize = 4;
/// Default scratch space for the mark stack (2 MiB).
pub const DEFAULT_SCRATCH_SPACE_SIZE: usize = 1 << 21;
/// Default number of objects the concurrent marker scans per lock hold.
pub const DEFAULT_MARKER_BATCH_SIZE: usize = 256;

/// Heap sizing and collection heuristics.
///
/// ```
/// use bytemap_gc::GcConfig;
///
/// let config = GcConfig::default()
///     .with_full_gc_interval(3)
///     .with_concurrent_marking(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Arenas each size class may map before allocation first collects.
    pub initial_arenas_per_class: usize,
    /// Factor applied to a class's arena limit when it must grow.
    pub grow_factor: f64,
    /// Slack over the arenas in use below which a limit is shrunk back.
    pub shrink_factor: f64,
    /// Heap resizings between forced full collections.
    pub full_gc_interval: u32,
    /// Collections between sweeps of the large-object class.
    pub release_large_interval: u32,
    /// Occupancy (0.0 - 1.0] at which a swept arena stays on the full list.
    pub arena_full_ratio: f64,
    /// Fraction (0.0 - 1.0] of untouched bump space above which sweep
    /// skips building a free list.
    pub freelist_virgin_threshold: f64,
    /// Bytes reserved for the mark stack.
    pub scratch_space_size: usize,
    /// Run a background marker thread between collections.
    pub concurrent_marking: bool,
    /// Objects the background marker scans before re-checking for waiters.
    pub marker_batch_size: usize,
    /// Check heap invariants before and after every collection.
    pub verify_heap: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_arenas_per_class: DEFAULT_INITIAL_ARENAS,
            grow_factor: 1.4,
            shrink_factor: 1.2,
            full_gc_interval: 5,
            release_large_interval: 2,
            arena_full_ratio: 0.95,
            freelist_virgin_threshold: 0.8,
            scratch_space_size: DEFAULT_SCRATCH_SPACE_SIZE,
            concurrent_marking: false,
            marker_batch_size: DEFAULT_MARKER_BATCH_SIZE,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Sets [`GcConfig::initial_arenas_per_class`].
    #[must_use]
    pub const fn with_initial_arenas_per_class(mut self, arenas: usize) -> Self {
        self.initial_arenas_per_class = arenas;
        self
    }

    /// Sets [`GcConfig::grow_factor`].
    #[must_use]
    pub const fn with_grow_factor(mut self, factor: f64) -> Self {
        self.grow_factor = factor;
        self
    }

    /// Sets [`GcConfig::shrink_factor`].
    #[must_use]
    pub const fn with_shrink_factor(mut self, factor: f64) -> Self {
        self.shrink_factor = factor;
        self
    }

    /// Sets [`GcConfig::full_gc_interval`].
    #[must_use]
    pub const fn with_full_gc_interval(mut self, interval: u32) -> Self {
        self.full_gc_interval = interval;
        self
    }

    /// Sets [`GcConfig::release_large_interval`].
    #[must_use]
    pub const fn with_release_large_interval(mut self, interval: u32) -> Self {
        self.release_large_interval = interval;
        self
    }

    /// Sets [`GcConfig::arena_full_ratio`].
    #[must_use]
    pub const fn with_arena_full_ratio(mut self, ratio: f64) -> Self {
        self.arena_full_ratio = ratio;
        self
    }

    /// Sets [`GcConfig::freelist_virgin_threshold`].
    #[must_use]
    pub const fn with_freelist_virgin_threshold(mut self, threshold: f64) -> Self {
        self.freelist_virgin_threshold = threshold;
        self
    }

    /// Sets [`GcConfig::scratch_space_size`].
    #[must_use]
    pub const fn with_scratch_space_size(mut self, bytes: usize) -> Self {
        self.scratch_space_size = bytes;
        self
    }

    /// Sets [`GcConfig::concurrent_marking`].
    #[must_use]
    pub const fn with_concurrent_marking(mut self, enabled: bool) -> Self {
        self.concurrent_marking = enabled;
        self
    }

    /// Sets [`GcConfig::marker_batch_size`].
    #[must_use]
    pub const fn with_marker_batch_size(mut self, objects: usize) -> Self {
        self.marker_batch_size = objects;
        self
    }

    /// Sets [`GcConfig::verify_heap`].
    #[must_use]
    pub const fn with_verify_heap(mut self, verify: bool) -> Self {
        self.verify_heap = verify;
        self
    }

    /// Checks that every knob is usable.
    ///
    /// # Errors
    ///
    /// Returns a static description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_arenas_per_class == 0 {
            return Err("initial_arenas_per_class must be > 0");
        }
        if self.grow_factor.is_nan() || self.grow_factor <= 1.0 {
            return Err("grow_factor must be > 1.0");
        }
        if self.shrink_factor.is_nan() || self.shrink_factor <= 1.0 {
            return Err("shrink_factor must be > 1.0");
        }
        if self.full_gc_interval == 0 {
            return Err("full_gc_interval must be > 0");
        }
        if !is_unit_fraction(self.arena_full_ratio) {
            return Err("arena_full_ratio must be in (0.0, 1.0]");
        }
        if !is_unit_fraction(self.freelist_virgin_threshold) {
            return Err("freelist_virgin_threshold must be in (0.0, 1.0]");
        }
        if self.scratch_space_size < std::mem::size_of::<StackChunk>() {
            return Err("scratch_space_size cannot hold a single mark stack chunk");
        }
        if self.marker_batch_size == 0 {
            return Err("marker_batch_size must be > 0");
        }
        Ok(())
    }
}

fn is_unit_fraction(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}
