//! In-flight usage tracking for a registry generation.
//!
//! Every execution holds a [`UsageTicket`] for the generation it runs
//! against. Retiring a guard stops new tickets from being issued; the
//! reaper then waits for the outstanding ones before destroying the
//! generation's units.
//!
//! Issuing and retiring race on two `SeqCst` atomics: `acquire` bumps the
//! counter and then checks `retired`, `retire` sets `retired` and then
//! reads the counter. Either the reaper sees the new ticket and waits for
//! it, or the caller sees the retirement and backs off to the successor
//! generation. A ticket can never be issued after the drain was observed.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct UsageGuard {
    generation: u64,
    in_flight: AtomicUsize,
    retired: AtomicBool,
    lock: Mutex<()>,
    drained: Condvar,
}

impl UsageGuard {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Register one in-flight execution. Returns `None` once the guard has
    /// been retired; the caller should move on to the current generation.
    pub fn acquire(self: &Arc<Self>) -> Option<UsageTicket> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.retired.load(Ordering::SeqCst) {
            self.release();
            return None;
        }
        Some(UsageTicket {
            guard: Arc::clone(self),
        })
    }

    fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "usage counter underflow");
        if previous == 1 && self.retired.load(Ordering::SeqCst) {
            // Notify under the lock so a waiter between its check and its
            // wait cannot miss the wakeup.
            let _guard = self.lock.lock();
            self.drained.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop issuing tickets. Idempotent.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Block until every ticket issued by this guard has been released.
    ///
    /// Never gives up: a warning is logged once `warn_after` elapses and the
    /// wait continues.
    pub fn wait_drained(&self, warn_after: Duration) {
        let started = Instant::now();
        let mut warned = false;
        let mut guard = self.lock.lock();
        while self.in_flight() != 0 {
            let slice = if warned {
                Duration::from_secs(1)
            } else {
                warn_after.saturating_sub(started.elapsed()).max(Duration::from_millis(1))
            };
            self.drained.wait_for(&mut guard, slice);
            if !warned && self.in_flight() != 0 && started.elapsed() >= warn_after {
                warned = true;
                tracing::warn!(
                    generation = self.generation,
                    in_flight = self.in_flight(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "retired unit registry is still in use; waiting for executions to finish"
                );
            }
        }
    }
}

/// Proof of one in-flight execution. Releases on drop.
pub struct UsageTicket {
    guard: Arc<UsageGuard>,
}

impl UsageTicket {
    pub fn generation(&self) -> u64 {
        self.guard.generation
    }

    pub fn release(self) {}
}

impl Drop for UsageTicket {
    fn drop(&mut self) {
        self.guard.release();
    }
}
