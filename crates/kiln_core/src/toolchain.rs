use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::source::SourceStore;
use arc_swap::ArcSwap;
use kiln_metrics::{Counter, Snapshot};
use std::sync::Arc;

/// Collaborators shared by every registry generation of one engine.
pub struct Toolchain {
    pub compiler: Arc<dyn Compiler>,
    pub store: Arc<dyn SourceStore>,
    pub stats: Counter,
    config: ArcSwap<EngineConfig>,
}

impl Toolchain {
    pub fn new(compiler: Arc<dyn Compiler>, store: Arc<dyn SourceStore>) -> Self {
        Self::with_config(compiler, store, EngineConfig::default())
    }

    pub fn with_config(
        compiler: Arc<dyn Compiler>,
        store: Arc<dyn SourceStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            compiler,
            store,
            stats: Counter::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// The configuration in effect right now.
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    /// Swap the configuration, returning the one it replaced.
    pub fn set_config(&self, config: EngineConfig) -> Arc<EngineConfig> {
        self.config.swap(Arc::new(config))
    }

    pub fn stats(&self) -> Snapshot {
        self.stats.snapshot()
    }
}
