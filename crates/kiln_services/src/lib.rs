//! Kiln Services Layer
//!
//! Settings, and the plumbing that feeds source changes to an engine.

pub mod feed;
pub mod poll;
pub mod settings;

pub use feed::{ChangeFeed, ChangeSender};
pub use poll::SourcePoller;
pub use settings::{Settings, SettingsError, WatchSettings};

use kiln_core::{Engine, SourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running change feed and the poller driving it.
pub struct Watching {
    feed: ChangeFeed,
    poller: Option<JoinHandle<()>>,
}

impl Watching {
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub async fn stop(self) {
        if let Some(poller) = self.poller {
            poller.abort();
            // Cancelled is the expected outcome.
            let _ = poller.await;
        }
        self.feed.close().await;
    }
}

/// Start feeding changes from `store` into `engine` on the current tokio
/// runtime. The poller only runs when `settings.enabled` is set.
pub fn start_watching(engine: &Engine, store: Arc<dyn SourceStore>, settings: &WatchSettings) -> Watching {
    let feed = ChangeFeed::spawn(engine.watcher(), Duration::from_millis(settings.debounce_ms));
    let poller = settings.enabled.then(|| {
        let poller = SourcePoller::new(store);
        tracing::info!(
            scripts = poller.tracked(),
            interval_ms = settings.poll_interval_ms,
            "watching sources"
        );
        poller.spawn(Duration::from_millis(settings.poll_interval_ms.max(1)), feed.sender())
    });
    Watching { feed, poller }
}
