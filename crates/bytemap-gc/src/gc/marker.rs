//! Background marker and its handshake with the mutator.
//!
//! One mutex guards the mark stack and every mark-byte access, whoever makes
//! it. Three flags coordinate around it:
//!
//! - `paused`: set by the collector before it needs exclusive access (full
//!   bytemap reset, final drain, sweep). The marker stops at the next object
//!   and sleeps until it is cleared.
//! - `writer_waiting`: set by the mutator before it blocks on the lock for a
//!   write barrier. The marker checks it between objects and hands the lock
//!   over fairly, so a barrier never waits for a whole batch.
//! - `shutdown`: the cancellation token. The marker exits at its next check.
//!
//! The condition variable wakes the marker when work arrives or a pause ends.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::gc::mark::{DrainOutcome, MarkState};

/// State shared between the heap and the marker thread.
pub struct MarkShared {
    state: Mutex<MarkState>,
    work: Condvar,
    paused: AtomicBool,
    writer_waiting: CachePadded<AtomicBool>,
    shutdown: AtomicBool,
}

impl MarkShared {
    pub(crate) fn new(state: MarkState) -> Self {
        Self {
            state: Mutex::new(state),
            work: Condvar::new(),
            paused: AtomicBool::new(false),
            writer_waiting: CachePadded::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Plain lock. Readers and the marker itself use it: they wait for the
    /// holder instead of asking the marker to step aside.
    pub(crate) fn lock(&self) -> MutexGuard<'_, MarkState> {
        self.state.lock()
    }

    /// Lock for a mutator write. Flags `writer_waiting` while blocked so the
    /// marker yields between objects.
    pub(crate) fn lock_for_write(&self) -> MutexGuard<'_, MarkState> {
        if let Some(guard) = self.state.try_lock() {
            return guard;
        }
        self.writer_waiting.store(true, Ordering::Release);
        let guard = self.state.lock();
        self.writer_waiting.store(false, Ordering::Release);
        guard
    }

    /// Stops the marker and takes the lock for an exclusive phase.
    pub(crate) fn pause(&self) -> MutexGuard<'_, MarkState> {
        self.paused.store(true, Ordering::Release);
        self.state.lock()
    }

    /// Ends an exclusive phase started by [`MarkShared::pause`].
    pub(crate) fn resume(&self, guard: MutexGuard<'_, MarkState>) {
        self.paused.store(false, Ordering::Release);
        drop(guard);
        self.work.notify_one();
    }

    /// Wakes the marker if it is waiting for work.
    pub(crate) fn notify_work(&self) {
        self.work.notify_one();
    }

    /// Whether the marker is currently told to hold off.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn should_yield(&self) -> bool {
        self.writer_waiting.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MarkShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkShared")
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .field("writer_waiting", &self.writer_waiting.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Marker loop body: sleep until there is work and no pause, then drain in
/// batches of `batch`, stepping aside whenever the mutator wants the lock.
fn run(shared: &MarkShared, batch: usize) {
    let backoff = Backoff::new();
    let mut state = shared.lock();
    loop {
        while !shared.is_shutdown() && (shared.is_paused() || state.stack.is_empty()) {
            shared.work.wait(&mut state);
        }
        if shared.is_shutdown() {
            return;
        }

        // SAFETY: objects on the stack stay allocated until the collector
        // sweeps, and sweeping requires the lock we hold.
        let outcome = unsafe { state.drain_bounded(batch, || shared.should_yield()) };
        match outcome {
            DrainOutcome::Interrupted => {
                MutexGuard::unlocked_fair(&mut state, || backoff.snooze());
            }
            DrainOutcome::BudgetExhausted => {
                backoff.reset();
                MutexGuard::bump(&mut state);
            }
            DrainOutcome::Empty => backoff.reset(),
        }
    }
}

/// Handle to the background marker thread.
#[derive(Debug)]
pub struct MarkerThread {
    handle: Option<JoinHandle<()>>,
}

impl MarkerThread {
    /// Spawns the marker.
    ///
    /// # Errors
    ///
    /// Propagates the thread spawn error.
    pub fn spawn(shared: Arc<MarkShared>, batch: usize) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("bytemap-gc-marker".into())
            .spawn(move || {
                #[cfg(feature = "tracing")]
                tracing::debug!(batch, "marker_started");
                run(&shared, batch);
                #[cfg(feature = "tracing")]
                tracing::debug!("marker_stopped");
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Signals shutdown and joins the thread.
    pub fn stop(&mut self, shared: &MarkShared) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            // Taking the lock orders the flag with the marker's condition
            // check, so the notify below cannot be lost.
            let _guard = shared.state.lock();
            shared.shutdown.store(true, Ordering::Release);
        }
        shared.work.notify_all();
        if handle.join().is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("marker thread panicked");
        }
    }

    /// Whether the thread is still attached.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::mark_stack::MarkStack;

    fn shared() -> Arc<MarkShared> {
        Arc::new(MarkShared::new(MarkState::new(MarkStack::new(1 << 16).unwrap())))
    }

    #[test]
    fn marker_starts_and_stops() {
        let shared = shared();
        let mut marker = MarkerThread::spawn(Arc::clone(&shared), 16).unwrap();
        assert!(marker.is_running());
        marker.stop(&shared);
        assert!(!marker.is_running());
        // Stopping twice is a no-op.
        marker.stop(&shared);
    }

    #[test]
    fn pause_holds_the_lock_until_resume() {
        let shared = shared();
        let mut marker = MarkerThread::spawn(Arc::clone(&shared), 16).unwrap();

        let guard = shared.pause();
        assert!(shared.is_paused());
        assert!(shared.state.try_lock().is_none());
        shared.resume(guard);
        assert!(!shared.is_paused());

        let guard = shared.lock_for_write();
        assert!(!shared.writer_waiting.load(Ordering::Acquire));
        drop(guard);
        marker.stop(&shared);
    }

    #[test]
    fn only_blocked_writers_ask_the_marker_to_yield() {
        use std::time::{Duration, Instant};

        let shared = shared();
        let wait_for_waiter = || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !shared.writer_waiting.load(Ordering::Acquire) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            shared.writer_waiting.load(Ordering::Acquire)
        };

        thread::scope(|scope| {
            let held = shared.lock();
            let reader = scope.spawn(|| drop(shared.lock()));
            thread::sleep(Duration::from_millis(50));
            assert!(!shared.should_yield());
            drop(held);
            reader.join().unwrap();
        });

        thread::scope(|scope| {
            let held = shared.lock();
            let writer = scope.spawn(|| drop(shared.lock_for_write()));
            assert!(wait_for_waiter());
            assert!(shared.should_yield());
            drop(held);
            writer.join().unwrap();
        });
        assert!(!shared.should_yield());
    }
}
