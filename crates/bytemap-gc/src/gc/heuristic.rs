//! Heap sizing and collection scheduling.

use crate::arena::Arena;
use crate::config::GcConfig;
use crate::heap::SizeClass;

/// Decides when the heap grows or shrinks and when a collection must be full.
///
/// Two countdowns drive the periodic work. The full-collection countdown
/// ticks whenever a class limit is resized; once it reaches zero the next
/// collection triggered by allocation is a full one. The large-class
/// countdown ticks on every sweep; the large class is only swept when it
/// expires (or the collection is full).
#[derive(Debug, Clone)]
pub struct HeapPolicy {
    grow_factor: f64,
    shrink_factor: f64,
    arena_full_ratio: f64,
    initial_limit: usize,
    full_gc_interval: u32,
    full_gc_countdown: u32,
    release_large_interval: u32,
    release_large_countdown: u32,
}

impl HeapPolicy {
    /// Policy for `config`.
    #[must_use]
    pub const fn new(config: &GcConfig) -> Self {
        Self {
            grow_factor: config.grow_factor,
            shrink_factor: config.shrink_factor,
            arena_full_ratio: config.arena_full_ratio,
            initial_limit: config.initial_arenas_per_class,
            full_gc_interval: config.full_gc_interval,
            full_gc_countdown: config.full_gc_interval,
            release_large_interval: config.release_large_interval,
            release_large_countdown: config.release_large_interval,
        }
    }

    /// Whether the next allocation-triggered collection must be full.
    #[must_use]
    pub const fn is_full_gc_due(&self) -> bool {
        self.full_gc_countdown == 0
    }

    /// Restarts the full-collection countdown.
    pub const fn full_gc_done(&mut self) {
        self.full_gc_countdown = self.full_gc_interval;
    }

    const fn tick_full_gc(&mut self) {
        self.full_gc_countdown = self.full_gc_countdown.saturating_sub(1);
    }

    /// Raises the arena limit of `class` to `limit * grow_factor + 1`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn grow_heap(&mut self, class: usize, sc: &mut SizeClass) {
        self.tick_full_gc();
        let grown = (sc.size_limit as f64 * self.grow_factor) as usize + 1;
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_limit_change(class, sc.size_limit, grown, sc.size);
        sc.size_limit = grown;
    }

    /// Lowers the arena limit of `class` to `size * shrink_factor + 1` when
    /// that is both below the current limit and not below the initial one.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn try_shrink_heap(&mut self, class: usize, sc: &mut SizeClass) {
        let shrunk = (sc.size as f64 * self.shrink_factor) as usize + 1;
        if sc.size_limit > shrunk && shrunk >= self.initial_limit {
            self.tick_full_gc();
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_limit_change(class, sc.size_limit, shrunk, sc.size);
            sc.size_limit = shrunk;
        }
    }

    /// Ticks the large-class countdown; `true` when the large class is due
    /// for a sweep.
    pub const fn check_release_large(&mut self) -> bool {
        if self.release_large_countdown > 0 {
            self.release_large_countdown -= 1;
            return false;
        }
        self.release_large_countdown = self.release_large_interval;
        true
    }

    /// Whether `arena` is dense enough to stay on the full list.
    #[must_use]
    pub fn is_considered_full(&self, arena: &Arena) -> bool {
        arena.occupancy() >= self.arena_full_ratio
    }

    /// Whether a partial collection should sweep `arena` from the full list.
    #[must_use]
    pub fn is_sweeping_candidate(arena: &Arena) -> bool {
        arena.header().is_large() || !arena.was_full()
    }

    /// Records the arena's density after a sweep.
    pub fn sweeping_done(&self, arena: &mut Arena) {
        arena.set_was_full(self.is_considered_full(arena));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(size: usize, size_limit: usize) -> SizeClass {
        SizeClass {
            size,
            size_limit,
            ..SizeClass::default()
        }
    }

    #[test]
    fn growth_follows_factor_and_counts_toward_full_gc() {
        let mut policy = HeapPolicy::new(&GcConfig::default().with_full_gc_interval(2));
        let mut sc = class(4, 4);
        assert!(!policy.is_full_gc_due());

        policy.grow_heap(0, &mut sc);
        assert_eq!(sc.size_limit(), 6); // 4 * 1.4 + 1
        policy.grow_heap(0, &mut sc);
        assert_eq!(sc.size_limit(), 9); // 6 * 1.4 + 1
        assert!(policy.is_full_gc_due());

        policy.full_gc_done();
        assert!(!policy.is_full_gc_due());
    }

    #[test]
    fn shrink_respects_initial_limit() {
        let mut policy = HeapPolicy::new(&GcConfig::default());
        let mut sc = class(10, 40);
        policy.try_shrink_heap(0, &mut sc);
        assert_eq!(sc.size_limit(), 13); // 10 * 1.2 + 1

        let mut sc = class(1, 9);
        policy.try_shrink_heap(0, &mut sc);
        assert_eq!(sc.size_limit(), 9, "2 is below the initial limit of 4");

        let mut sc = class(10, 13);
        policy.try_shrink_heap(0, &mut sc);
        assert_eq!(sc.size_limit(), 13);
    }

    #[test]
    fn large_class_release_cadence() {
        let mut policy = HeapPolicy::new(&GcConfig::default().with_release_large_interval(2));
        let pattern: Vec<bool> = (0..6).map(|_| policy.check_release_large()).collect();
        assert_eq!(pattern, [false, false, true, false, false, true]);

        let mut every = HeapPolicy::new(&GcConfig::default().with_release_large_interval(0));
        assert!((0..3).all(|_| every.check_release_large()));
    }
}
