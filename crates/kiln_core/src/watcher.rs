//! Change watcher: turns source change notifications into invalidation or
//! renewal.
//!
//! A batch is applied in two passes. Every event first goes through
//! [`UnitRegistry::invalidate`](crate::UnitRegistry::invalidate), so no
//! per-path invalidation in the batch is skipped. If any event asked for a
//! renewal, the registry is then renewed exactly once.

use crate::engine::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn added(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Added)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Modified)
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self::new(path, ChangeKind::Removed)
    }

    pub fn is_removal(&self) -> bool {
        self.kind == ChangeKind::Removed
    }
}

/// Events collected over one debounce window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Keep only the last event per path, in order of each path's first
    /// appearance. A path added and then removed inside one window ends up
    /// as a removal.
    pub fn coalesce(self) -> Vec<ChangeEvent> {
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut coalesced: Vec<ChangeEvent> = Vec::with_capacity(self.events.len());
        for event in self.events {
            match slots.get(&event.path) {
                Some(&slot) => coalesced[slot] = event,
                None => {
                    slots.insert(event.path.clone(), coalesced.len());
                    coalesced.push(event);
                }
            }
        }
        coalesced
    }
}

impl FromIterator<ChangeEvent> for ChangeBatch {
    fn from_iter<T: IntoIterator<Item = ChangeEvent>>(iter: T) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

/// What a batch did to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Nothing to do: empty batch or engine shut down.
    Ignored,
    /// Applied in place to the current registry. `events` counts the
    /// changes applied, including ones for paths with no unit.
    Patched { events: usize },
    /// The registry was replaced; `generation` is the new one.
    Renewed { generation: u64 },
}

/// Receives change notifications for one engine.
#[derive(Clone)]
pub struct ChangeWatcher {
    engine: Engine,
}

impl ChangeWatcher {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn on_change(&self, events: &[ChangeEvent]) -> ChangeOutcome {
        if events.is_empty() {
            return ChangeOutcome::Ignored;
        }
        let needs_renewal = self.engine.with_registry(|registry| {
            events.iter().fold(false, |renew, event| {
                tracing::trace!(path = %event.path, kind = ?event.kind, "source changed");
                registry.invalidate(&event.path, event.is_removal()) || renew
            })
        });

        match needs_renewal {
            None => ChangeOutcome::Ignored,
            Some(false) => ChangeOutcome::Patched {
                events: events.len(),
            },
            Some(true) => match self.engine.renew() {
                Some(generation) => ChangeOutcome::Renewed { generation },
                None => ChangeOutcome::Ignored,
            },
        }
    }

    /// The compiler's artifact cache was cleared under `namespace`.
    pub fn on_cache_clear(&self, namespace: &str) -> ChangeOutcome {
        if !self.engine.config().clears_compiler_cache(namespace) {
            return ChangeOutcome::Ignored;
        }
        tracing::info!(namespace, "compiler cache cleared");
        match self.engine.renew() {
            Some(generation) => ChangeOutcome::Renewed { generation },
            None => ChangeOutcome::Ignored,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::test_support::Fixture;
    use kiln_metrics::Event;

    fn serve(fx: &Fixture, paths: &[&str]) -> Engine {
        let engine = Engine::builder(fx.compiler.clone(), fx.store.clone()).build();
        for path in paths {
            engine.run(&mut RequestContext::new(*path)).expect("runs");
        }
        engine
    }

    #[test]
    fn coalesce_keeps_last_event_per_path() {
        let batch: ChangeBatch = [
            ChangeEvent::added("/a.js"),
            ChangeEvent::modified("/b.js"),
            ChangeEvent::removed("/a.js"),
            ChangeEvent::modified("/b.js"),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            batch.coalesce(),
            vec![ChangeEvent::removed("/a.js"), ChangeEvent::modified("/b.js")]
        );
    }

    #[test]
    fn batch_applies_every_invalidation_then_renews_once() {
        let fx = Fixture::new(&[("/a.js", "write:a"), ("/b.js", "write:b")]);
        let engine = serve(&fx, &["/a.js", "/b.js"]);
        let watcher = engine.watcher();
        let start = engine.generation().expect("serving");

        let outcome = watcher.on_change(&[
            ChangeEvent::modified("/x.lib"),
            ChangeEvent::modified("/a.js"),
            ChangeEvent::modified("/y.tld"),
        ]);

        assert_eq!(outcome, ChangeOutcome::Renewed { generation: start + 1 });
        assert_eq!(engine.stats().get(Event::Renewal), 1);
        assert_eq!(engine.stats().get(Event::Invalidation), 1);
    }

    #[test]
    fn removal_evicts_and_script_path_patches() {
        let fx = Fixture::new(&[("/a.js", "write:a"), ("/b.js", "write:b")]);
        let engine = serve(&fx, &["/a.js", "/b.js"]);
        let watcher = engine.watcher();
        fx.store.remove("/b.js");

        let outcome = watcher.on_change(&[ChangeEvent::removed("/b.js")]);
        assert_eq!(outcome, ChangeOutcome::Patched { events: 1 });
        assert_eq!(engine.unit_count(), 1);
        assert_eq!(engine.stats().get(Event::Eviction), 1);

        let missing = engine.run(&mut RequestContext::new("/b.js")).unwrap_err();
        assert_eq!(missing.status_hint(), 404);
    }

    #[test]
    fn patched_counts_events_not_units() {
        let fx = Fixture::new(&[("/a.js", "write:a")]);
        let engine = serve(&fx, &["/a.js"]);

        let outcome = engine.watcher().on_change(&[
            ChangeEvent::modified("/a.js"),
            ChangeEvent::added("/never-run.js"),
        ]);
        assert_eq!(outcome, ChangeOutcome::Patched { events: 2 });
        assert_eq!(engine.stats().get(Event::Invalidation), 1);
    }

    #[test]
    fn shared_marker_renews() {
        let fx = Fixture::new(&[]);
        let engine = serve(&fx, &[]);
        let outcome = engine.watcher().on_change(&[ChangeEvent::modified("/.kiln/shared")]);
        assert!(matches!(outcome, ChangeOutcome::Renewed { .. }));
    }

    #[test]
    fn cache_clear_renews_only_for_our_namespace() {
        let fx = Fixture::new(&[]);
        let engine = serve(&fx, &[]);
        let watcher = engine.watcher();

        assert_eq!(watcher.on_cache_clear("/other"), ChangeOutcome::Ignored);
        assert!(matches!(watcher.on_cache_clear("/kiln"), ChangeOutcome::Renewed { .. }));
        assert!(matches!(
            watcher.on_cache_clear("/kiln/compiled"),
            ChangeOutcome::Renewed { .. }
        ));
    }

    #[test]
    fn changes_after_shutdown_are_ignored() {
        let fx = Fixture::new(&[]);
        let engine = serve(&fx, &[]);
        let watcher = engine.watcher();
        engine.shutdown();

        assert_eq!(watcher.on_change(&[ChangeEvent::modified("/x.lib")]), ChangeOutcome::Ignored);
        assert_eq!(watcher.on_change(&[]), ChangeOutcome::Ignored);
    }
}
