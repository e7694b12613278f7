//! Registry generations and their deferred teardown.

use crate::registry::UnitRegistry;
use crate::toolchain::Toolchain;
use crate::usage::UsageGuard;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One registry together with the guard counting executions against it.
pub(crate) struct Generation {
    pub(crate) registry: UnitRegistry,
    pub(crate) usage: Arc<UsageGuard>,
}

impl Generation {
    pub(crate) fn new(id: u64, toolchain: Arc<Toolchain>) -> Self {
        Self {
            registry: UnitRegistry::new(id, toolchain),
            usage: Arc::new(UsageGuard::new(id)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.registry.generation()
    }

    /// Wait for the last in-flight execution, then destroy the registry.
    /// The usage guard must already be retired.
    fn teardown(&self, warn_after: Duration) {
        self.usage.wait_drained(warn_after);
        self.registry.destroy();
    }
}

/// Tears down retired generations on background threads.
#[derive(Default)]
pub(crate) struct Reaper {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Reaper {
    /// Stop new executions on `generation` and destroy it once drained.
    ///
    /// Callers must have unpublished `generation` first: a retired guard
    /// sends late arrivals back to whatever is current.
    pub(crate) fn retire(&self, generation: Arc<Generation>, warn_after: Duration) {
        generation.usage.retire();
        let id = generation.id();
        let worker = Arc::clone(&generation);
        let spawned = std::thread::Builder::new()
            .name(format!("kiln-reaper-{id}"))
            .spawn(move || worker.teardown(warn_after));

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
            }
            Err(err) => {
                tracing::warn!(generation = id, error = %err, "failed to spawn reaper thread; tearing down inline");
                generation.teardown(warn_after);
            }
        }
    }

    /// Block until every pending teardown has finished.
    pub(crate) fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("reaper thread panicked during registry teardown");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.len()
    }
}
