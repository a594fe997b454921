//! Loom models of the marker handshake.
//!
//! The marker sleeps on a condition variable until there is work or a
//! shutdown request, and the collector pauses it by flagging and taking the
//! lock. These models check the two properties that protocol relies on: a
//! shutdown request set under the lock is never missed, and work drained by
//! the marker is never also claimed by a collector reset.

use loom::sync::atomic::{AtomicBool, Ordering};
use loom::sync::{Arc, Condvar, Mutex};

struct Shared {
    stack: Mutex<Vec<u32>>,
    work: Condvar,
    paused: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    fn new(items: Vec<u32>) -> Self {
        Self {
            stack: Mutex::new(items),
            work: Condvar::new(),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }
}

/// Drains one item per wake-up until shut down; returns what it drained.
fn marker(shared: &Shared) -> Vec<u32> {
    let mut drained = Vec::new();
    let mut stack = shared.stack.lock().unwrap();
    loop {
        while !shared.shutdown.load(Ordering::Acquire)
            && (shared.paused.load(Ordering::Acquire) || stack.is_empty())
        {
            stack = shared.work.wait(stack).unwrap();
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return drained;
        }
        if let Some(item) = stack.pop() {
            drained.push(item);
        }
    }
}

fn stop(shared: &Shared) {
    {
        let _guard = shared.stack.lock().unwrap();
        shared.shutdown.store(true, Ordering::Release);
    }
    shared.work.notify_all();
}

#[test]
#[ignore = "loom test - run with cargo test --release loom_shutdown -- --ignored"]
fn loom_shutdown_is_never_lost() {
    loom::model(|| {
        let shared = Arc::new(Shared::new(Vec::new()));
        let handle = loom::thread::spawn({
            let shared = Arc::clone(&shared);
            move || marker(&shared)
        });
        stop(&shared);
        assert!(handle.join().unwrap().is_empty());
    });
}

#[test]
#[ignore = "loom test - run with cargo test --release loom_pause -- --ignored"]
fn loom_pause_and_reset_never_double_claim() {
    loom::model(|| {
        let shared = Arc::new(Shared::new(vec![1, 2]));
        let handle = loom::thread::spawn({
            let shared = Arc::clone(&shared);
            move || marker(&shared)
        });

        // Collector: pause, take the lock, claim whatever is left.
        shared.paused.store(true, Ordering::Release);
        let reset: Vec<u32> = {
            let mut stack = shared.stack.lock().unwrap();
            std::mem::take(&mut *stack)
        };
        shared.paused.store(false, Ordering::Release);
        shared.work.notify_one();

        stop(&shared);
        let mut all = handle.join().unwrap();
        all.extend(reset);
        all.sort_unstable();
        assert_eq!(all, [1, 2]);
    });
}
