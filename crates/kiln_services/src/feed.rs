//! Debounced change feed
//!
//! Change sources push single events; the feed groups everything that
//! arrives within the debounce window of the first event into one batch,
//! coalesces it and hands it to the [`ChangeWatcher`]. A batch closes when
//! the window since its first event elapses, so a steady stream of changes
//! still makes progress.

use kiln_core::{ChangeBatch, ChangeEvent, ChangeOutcome, ChangeWatcher};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cloneable handle for pushing events into a feed.
#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeSender {
    /// Queue `event`. Returns `false` once the feed has stopped.
    pub fn send(&self, event: ChangeEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

pub struct ChangeFeed {
    sender: ChangeSender,
    outcomes: broadcast::Sender<ChangeOutcome>,
    task: JoinHandle<()>,
}

impl ChangeFeed {
    /// Start the feed on the current tokio runtime.
    pub fn spawn(watcher: ChangeWatcher, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(64);
        let task = tokio::spawn(run(watcher, rx, debounce, outcomes.clone()));
        Self {
            sender: ChangeSender { tx },
            outcomes,
            task,
        }
    }

    pub fn sender(&self) -> ChangeSender {
        self.sender.clone()
    }

    pub fn send(&self, event: ChangeEvent) -> bool {
        self.sender.send(event)
    }

    /// Outcome of every batch applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeOutcome> {
        self.outcomes.subscribe()
    }

    /// Flush pending events and stop once every sender is gone.
    pub async fn close(self) {
        let Self { sender, task, .. } = self;
        drop(sender);
        if let Err(err) = task.await {
            tracing::error!(error = %err, "change feed task failed");
        }
    }
}

async fn run(
    watcher: ChangeWatcher,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    debounce: Duration,
    outcomes: broadcast::Sender<ChangeOutcome>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = ChangeBatch::new();
        batch.push(first);
        let deadline = Instant::now() + debounce;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            batch.push(event);
        }

        let received = batch.len();
        let events = batch.coalesce();
        let worker = watcher.clone();
        // Invalidation takes registry locks; keep it off the async workers.
        let outcome = match tokio::task::spawn_blocking(move || worker.on_change(&events)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "applying change batch failed");
                continue;
            }
        };
        tracing::debug!(received, ?outcome, "applied change batch");
        // Nobody listening is fine.
        let _ = outcomes.send(outcome);
    }
    tracing::debug!("change feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Engine, MemorySourceStore, RequestContext};
    use kiln_script::QuickJsCompiler;
    use std::sync::Arc;

    fn engine() -> Engine {
        let store = Arc::new(MemorySourceStore::new().with_file("/a.js", "response.write('a');"));
        let engine = Engine::builder(Arc::new(QuickJsCompiler::default()), store).build();
        engine.run(&mut RequestContext::new("/a.js")).expect("runs");
        engine
    }

    #[tokio::test]
    async fn burst_becomes_one_batch_and_one_renewal() {
        let engine = engine();
        let feed = ChangeFeed::spawn(engine.watcher(), Duration::from_millis(50));
        let mut outcomes = feed.subscribe();
        let start = engine.generation().expect("serving");

        let sender = feed.sender();
        assert!(sender.send(ChangeEvent::modified("/a.js")));
        assert!(sender.send(ChangeEvent::modified("/x.lib")));
        assert!(sender.send(ChangeEvent::modified("/y.lib")));
        assert!(sender.send(ChangeEvent::modified("/a.js")));

        let outcome = outcomes.recv().await.expect("batch outcome");
        assert_eq!(outcome, ChangeOutcome::Renewed { generation: start + 1 });
        assert_eq!(engine.generation(), Some(start + 1));

        drop(sender);
        feed.close().await;
    }

    #[tokio::test]
    async fn separate_windows_are_separate_batches() {
        let engine = engine();
        let feed = ChangeFeed::spawn(engine.watcher(), Duration::from_millis(20));
        let mut outcomes = feed.subscribe();

        feed.send(ChangeEvent::modified("/a.js"));
        assert_eq!(outcomes.recv().await.expect("first"), ChangeOutcome::Patched { events: 1 });

        feed.send(ChangeEvent::removed("/a.js"));
        feed.send(ChangeEvent::added("/b.js"));
        assert_eq!(outcomes.recv().await.expect("second"), ChangeOutcome::Patched { events: 2 });
        assert_eq!(engine.unit_count(), 0);

        feed.close().await;
    }

    #[tokio::test]
    async fn steady_stream_still_closes_batches() {
        let engine = engine();
        let feed = ChangeFeed::spawn(engine.watcher(), Duration::from_millis(50));
        let mut outcomes = feed.subscribe();

        // Never quiet for a whole window; batches must close anyway.
        for _ in 0..20 {
            feed.send(ChangeEvent::modified("/a.js"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(outcomes.try_recv(), Ok(ChangeOutcome::Patched { .. })));

        feed.close().await;
    }

    #[tokio::test]
    async fn close_flushes_pending_events() {
        let engine = engine();
        let feed = ChangeFeed::spawn(engine.watcher(), Duration::from_secs(60));
        let start = engine.generation().expect("serving");

        feed.send(ChangeEvent::modified("/.kiln/shared"));
        feed.close().await;
        assert_eq!(engine.generation(), Some(start + 1));
    }
}
