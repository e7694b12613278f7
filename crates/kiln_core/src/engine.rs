//! Engine facade: the per-request entry point.
//!
//! The engine publishes the current registry generation through an
//! [`ArcSwapOption`]. Every execution leases the generation it found: it
//! takes a usage ticket on that generation's guard and keeps the generation
//! alive until the ticket is dropped. Renewal swaps in a fresh, empty
//! generation under `renew_lock` and hands the old one to the reaper, which
//! destroys it once its last ticket is gone. `None` means shut down.

use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::context::{AmbientContext, AmbientScope, RequestContext, ThreadAmbient};
use crate::error::{EngineError, ScriptFailure};
use crate::generation::{Generation, Reaper};
use crate::registry::UnitRegistry;
use crate::source::SourceStore;
use crate::toolchain::Toolchain;
use crate::unit::UnitRole;
use crate::usage::UsageTicket;
use crate::watcher::ChangeWatcher;
use arc_swap::ArcSwapOption;
use kiln_metrics::{Event, LatencyWindow, Snapshot};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Builds an [`Engine`] from its collaborators.
pub struct EngineBuilder {
    compiler: Arc<dyn Compiler>,
    store: Arc<dyn SourceStore>,
    config: EngineConfig,
    ambient: Arc<dyn AmbientContext>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Execution context collaborator. Defaults to [`ThreadAmbient`].
    pub fn ambient(mut self, ambient: Arc<dyn AmbientContext>) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn build(self) -> Engine {
        let toolchain = Arc::new(Toolchain::with_config(self.compiler, self.store, self.config));
        let first = Arc::new(Generation::new(1, Arc::clone(&toolchain)));
        tracing::info!(generation = 1, "script engine started");
        Engine {
            inner: Arc::new(EngineInner {
                toolchain,
                ambient: self.ambient,
                current: ArcSwapOption::new(Some(first)),
                renew_lock: Mutex::new(()),
                next_generation: AtomicU64::new(2),
                reaper: Reaper::default(),
                latency: LatencyWindow::default(),
            }),
        }
    }
}

/// Compiled-script engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    toolchain: Arc<Toolchain>,
    ambient: Arc<dyn AmbientContext>,
    current: ArcSwapOption<Generation>,
    renew_lock: Mutex<()>,
    next_generation: AtomicU64,
    reaper: Reaper,
    latency: LatencyWindow,
}

/// A generation pinned for the duration of one execution.
struct Lease {
    generation: Arc<Generation>,
    _ticket: UsageTicket,
}

impl Lease {
    fn registry(&self) -> &UnitRegistry {
        &self.generation.registry
    }
}

impl Engine {
    pub fn builder(compiler: Arc<dyn Compiler>, store: Arc<dyn SourceStore>) -> EngineBuilder {
        EngineBuilder {
            compiler,
            store,
            config: EngineConfig::default(),
            ambient: Arc::new(ThreadAmbient),
        }
    }

    /// Run the script named by `request.script_path`.
    ///
    /// A script failure that names an error page is handed to that page on
    /// the same request; the page's outcome replaces the original one. The
    /// request's data context is ambient for the whole call and the previous
    /// one is restored on return.
    pub fn run(&self, request: &mut RequestContext) -> Result<(), EngineError> {
        let inner = &self.inner;
        let _scope = AmbientScope::enter(inner.ambient.as_ref(), request.data_context.clone());
        let path = request.script_path.clone();

        let outcome = kiln_metrics::time_scope!(inner.latency, {
            match inner.dispatch(request, &path, UnitRole::Script) {
                Err(EngineError::Script(ScriptFailure {
                    error_page: Some(page),
                    message,
                    ..
                })) => {
                    inner.toolchain.stats.increment(Event::ErrorPage);
                    tracing::debug!(path = %path, error_page = %page, error = %message, "dispatching to error page");
                    inner.dispatch(request, &page, UnitRole::ErrorPage)
                }
                other => other,
            }
        });

        if let Err(EngineError::ShutdownRace { path }) = &outcome {
            inner.toolchain.stats.increment(Event::ShutdownRace);
            tracing::warn!(path = %path, "script engine shut down concurrently");
        }
        outcome
    }

    /// Replace the current registry with an empty one. The old generation
    /// is destroyed in the background once its in-flight executions finish.
    ///
    /// Returns the new generation, or `None` after shutdown.
    pub fn renew(&self) -> Option<u64> {
        self.inner.renew()
    }

    /// Stop serving. Every later `run` fails with
    /// [`EngineError::ShutdownRace`]. Blocks until all retired generations
    /// are destroyed, so it must not be called from inside a script.
    /// Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let last = {
            let _guard = inner.renew_lock.lock();
            inner.current.swap(None)
        };
        if let Some(last) = last {
            tracing::info!(generation = last.id(), "shutting down script engine");
            inner.reaper.retire(last, inner.toolchain.config().drain_warn_after());
        }
        inner.reaper.join_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.current.load().is_none()
    }

    /// Current generation number, `None` after shutdown.
    pub fn generation(&self) -> Option<u64> {
        self.inner.current.load().as_ref().map(|generation| generation.id())
    }

    /// Units in the current registry.
    pub fn unit_count(&self) -> usize {
        self.inner
            .current
            .load()
            .as_ref()
            .map_or(0, |generation| generation.registry.len())
    }

    pub fn stats(&self) -> Snapshot {
        self.inner.toolchain.stats()
    }

    /// Execution latency over the most recent runs.
    pub fn latency(&self) -> &LatencyWindow {
        &self.inner.latency
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.inner.toolchain.config()
    }

    /// Install a new configuration. Existing units were compiled under the
    /// old one, so a changed [`EngineConfig::config_key`] renews the
    /// registry. Returns whether it did.
    pub fn reconfigure(&self, config: EngineConfig) -> bool {
        let key = config.config_key();
        let previous = self.inner.toolchain.set_config(config);
        if previous.config_key() == key {
            return false;
        }
        tracing::info!(previous = %previous.config_key(), current = %key, "engine configuration changed");
        self.renew().is_some()
    }

    /// Compile `paths` in parallel against the current generation.
    pub fn preload<I>(&self, paths: I) -> Vec<(String, Result<(), EngineError>)>
    where
        I: IntoIterator<Item = String>,
    {
        let paths: Vec<String> = paths.into_iter().collect();
        let results: Vec<(String, Result<(), EngineError>)> = paths
            .into_par_iter()
            .map(|path| {
                let outcome = self.inner.compile(&path);
                (path, outcome)
            })
            .collect();
        let failed = results.iter().filter(|(_, outcome)| outcome.is_err()).count();
        tracing::info!(units = results.len(), failed, "preloaded units");
        results
    }

    /// Change watcher driving this engine.
    pub fn watcher(&self) -> ChangeWatcher {
        ChangeWatcher::new(self.clone())
    }

    /// Run `f` against the current registry, `None` after shutdown.
    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&UnitRegistry) -> R) -> Option<R> {
        let current = self.inner.current.load_full()?;
        Some(f(&current.registry))
    }
}

impl EngineInner {
    /// Pin the current generation.
    ///
    /// The ticket is taken on the guard of the generation that was loaded,
    /// and the guard refuses it if that generation was retired in between.
    /// Retirement only happens after the successor is published, so the
    /// retry sees either a live generation or shutdown.
    fn lease(&self, path: &str) -> Result<Lease, EngineError> {
        loop {
            let Some(generation) = self.current.load_full() else {
                return Err(EngineError::ShutdownRace {
                    path: path.to_string(),
                });
            };
            if let Some(ticket) = generation.usage.acquire() {
                return Ok(Lease {
                    generation,
                    _ticket: ticket,
                });
            }
        }
    }

    fn dispatch(
        &self,
        request: &mut RequestContext,
        path: &str,
        role: UnitRole,
    ) -> Result<(), EngineError> {
        // A unit can be invalidated between lookup and execution; the next
        // lookup replaces it. Terminates once no change lands in that window.
        loop {
            let lease = self.lease(path)?;
            let registry = lease.registry();
            let unit = registry.lookup(path, role)?;
            let outcome = match role {
                UnitRole::Script => unit.execute(request, registry.toolchain()),
                UnitRole::ErrorPage => unit.execute_error_page(request, registry.toolchain()),
            };
            match outcome {
                Err(EngineError::StaleUnit { .. }) => {
                    tracing::debug!(path, generation = registry.generation(), "unit went stale before running; retrying");
                }
                other => return other,
            }
        }
    }

    fn compile(&self, path: &str) -> Result<(), EngineError> {
        let lease = self.lease(path)?;
        let registry = lease.registry();
        registry
            .get_or_create(path)?
            .ensure_compiled(registry.toolchain())
    }

    fn renew(&self) -> Option<u64> {
        let (id, retired) = {
            let _guard = self.renew_lock.lock();
            // Shut down stays shut down.
            if self.current.load().is_none() {
                return None;
            }
            let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let next = Arc::new(Generation::new(id, Arc::clone(&self.toolchain)));
            (id, self.current.swap(Some(next))?)
        };
        self.toolchain.stats.increment(Event::Renewal);
        tracing::info!(retired = retired.id(), generation = id, "renewed unit registry");
        kiln_metrics::metrics! {
            tracing::debug!(
                avg_ms = self.latency.average_ms(),
                in_flight = retired.usage.in_flight(),
                "execution latency at renewal"
            );
        }
        self.reaper.retire(retired, self.toolchain.config().drain_warn_after());
        Some(id)
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // No clone of the engine is left, so nothing can hold a lease.
        if let Some(last) = self.current.swap(None) {
            last.usage.retire();
            last.registry.destroy();
        }
        self.reaper.join_all();
    }
}
