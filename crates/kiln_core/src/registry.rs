//! Script path -> compiled unit map for one registry generation.
//!
//! Lookups are a sharded read of the map. Creating a unit takes the
//! registry-scoped `create_lock` and re-checks the map under it, so two
//! threads missing on the same path agree on a single unit: the second one
//! to get the lock finds the first one's unit and returns it. The lock is
//! never held while compiling or running a script.

use crate::error::EngineError;
use crate::toolchain::Toolchain;
use crate::unit::{CompiledUnit, UnitRole};
use dashmap::DashMap;
use kiln_metrics::Event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct UnitRegistry {
    generation: u64,
    units: DashMap<String, Arc<CompiledUnit>>,
    create_lock: Mutex<()>,
    destroyed: AtomicBool,
    toolchain: Arc<Toolchain>,
}

impl UnitRegistry {
    pub fn new(generation: u64, toolchain: Arc<Toolchain>) -> Self {
        Self {
            generation,
            units: DashMap::new(),
            create_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
            toolchain,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// The unit registered for `path`, valid or not.
    pub fn get(&self, path: &str) -> Option<Arc<CompiledUnit>> {
        self.units.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the valid unit for `path`, creating it on a miss.
    pub fn get_or_create(&self, path: &str) -> Result<Arc<CompiledUnit>, EngineError> {
        self.lookup(path, UnitRole::Script)
    }

    /// Same as [`get_or_create`](Self::get_or_create) for an error page. A
    /// unit created here carries the error-page designation.
    pub fn get_or_create_error_page(&self, path: &str) -> Result<Arc<CompiledUnit>, EngineError> {
        self.lookup(path, UnitRole::ErrorPage)
    }

    pub(crate) fn lookup(&self, path: &str, role: UnitRole) -> Result<Arc<CompiledUnit>, EngineError> {
        if let Some(unit) = self.usable(path) {
            return Ok(unit);
        }

        let _guard = self.create_lock.lock();
        // Another thread may have created it while we waited for the lock.
        if let Some(unit) = self.usable(path) {
            return Ok(unit);
        }
        if self.is_destroyed() {
            return Err(EngineError::ShutdownRace {
                path: path.to_string(),
            });
        }

        let unit = Arc::new(CompiledUnit::new(path, role));
        if let Some(stale) = self.units.insert(path.to_string(), Arc::clone(&unit)) {
            stale.invalidate();
            tracing::debug!(path, generation = self.generation, "replaced stale unit");
        } else {
            tracing::debug!(path, generation = self.generation, ?role, "created unit");
        }
        Ok(unit)
    }

    fn usable(&self, path: &str) -> Option<Arc<CompiledUnit>> {
        let unit = self.get(path)?;
        if !unit.is_valid() {
            return None;
        }
        let config = self.toolchain.config();
        if config.modification_check
            && unit.source_changed(&self.toolchain, config.modification_test_interval())
        {
            tracing::debug!(path, "source changed on disk; invalidating unit");
            unit.invalidate();
            self.toolchain.stats.increment(Event::Invalidation);
            return None;
        }
        Some(unit)
    }

    /// React to a change of `path`.
    ///
    /// Returns `true` when the change touches something every unit may
    /// depend on and the whole generation has to be renewed. Otherwise the
    /// unit for `path` and every unit that included it are invalidated in
    /// place and recompile lazily; a removal also evicts the entry.
    pub fn invalidate(&self, path: &str, removed: bool) -> bool {
        if self.toolchain.config().is_shared(path) {
            tracing::info!(path, generation = self.generation, "shared dependency changed");
            return true;
        }

        let mut invalidated = 0usize;
        if removed {
            let _guard = self.create_lock.lock();
            if let Some((_, unit)) = self.units.remove(path) {
                unit.invalidate();
                invalidated += 1;
                self.toolchain.stats.increment(Event::Eviction);
            }
        } else if let Some(unit) = self.get(path) {
            if unit.invalidate() {
                invalidated += 1;
            }
        }

        let dependents: Vec<Arc<CompiledUnit>> = self
            .units
            .iter()
            .filter(|entry| entry.value().depends_on(path))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for unit in dependents {
            if unit.invalidate() {
                invalidated += 1;
            }
        }

        if invalidated > 0 {
            self.toolchain.stats.add(Event::Invalidation, invalidated as u64);
            tracing::debug!(path, removed, invalidated, "invalidated units");
        }
        false
    }

    /// Release every unit and its compiler-side resources.
    ///
    /// Only call once no execution holds a ticket for this generation.
    /// Idempotent; later lookups fail with [`EngineError::ShutdownRace`].
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let units: Vec<(String, Arc<CompiledUnit>)> = {
            let _guard = self.create_lock.lock();
            let units = self
                .units
                .iter()
                .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                .collect();
            self.units.clear();
            units
        };
        for (path, unit) in &units {
            unit.invalidate();
            self.toolchain.compiler.release(path);
        }
        tracing::debug!(generation = self.generation, units = units.len(), "destroyed unit registry");
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("generation", &self.generation)
            .field("units", &self.units.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
