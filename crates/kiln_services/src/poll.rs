//! Polling change source
//!
//! For stores without change notifications: compares the store's listing
//! and timestamps against the previous pass and reports the difference.

use crate::feed::ChangeSender;
use kiln_core::{ChangeEvent, SourceStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

pub struct SourcePoller {
    store: Arc<dyn SourceStore>,
    known: HashMap<String, Option<SystemTime>>,
}

impl SourcePoller {
    /// Start from the store's current state; only later changes are reported.
    pub fn new(store: Arc<dyn SourceStore>) -> Self {
        let known = snapshot(store.as_ref());
        Self { store, known }
    }

    pub fn tracked(&self) -> usize {
        self.known.len()
    }

    /// Changes since the previous call, sorted by path.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let current = snapshot(self.store.as_ref());
        let mut events = Vec::new();
        for (path, stamp) in &current {
            match self.known.get(path) {
                None => events.push(ChangeEvent::added(path.clone())),
                Some(previous) if previous != stamp => events.push(ChangeEvent::modified(path.clone())),
                Some(_) => {}
            }
        }
        for path in self.known.keys() {
            if !current.contains_key(path) {
                events.push(ChangeEvent::removed(path.clone()));
            }
        }
        events.sort_by(|a, b| a.path.cmp(&b.path));
        self.known = current;
        events
    }

    /// Poll every `interval` and push changes into `sender` until the feed
    /// stops.
    pub fn spawn(self, interval: Duration, sender: ChangeSender) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the baseline is already taken.
            ticker.tick().await;
            let mut poller = self;
            loop {
                ticker.tick().await;
                let polled = tokio::task::spawn_blocking(move || {
                    let events = poller.poll();
                    (poller, events)
                })
                .await;
                let events = match polled {
                    Ok((returned, events)) => {
                        poller = returned;
                        events
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "source poll failed; polling stopped");
                        return;
                    }
                };
                if !events.is_empty() {
                    tracing::debug!(changes = events.len(), "poll found source changes");
                }
                for event in events {
                    if !sender.send(event) {
                        tracing::debug!("change feed closed; polling stopped");
                        return;
                    }
                }
            }
        })
    }
}

fn snapshot(store: &dyn SourceStore) -> HashMap<String, Option<SystemTime>> {
    store
        .list()
        .into_iter()
        .map(|path| {
            let stamp = store.last_modified(&path);
            (path, stamp)
        })
        .collect()
}
