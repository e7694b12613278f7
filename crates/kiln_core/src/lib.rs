//! Kiln Core
//!
//! Compiled script units and their lifecycle:
//! - Unit registry with double-checked, compile-once creation
//! - Usage tracking and drain-then-destroy registry renewal
//! - Engine facade with error-page fallback
//! - Change watcher deciding between in-place invalidation and renewal
//!
//! Compiling and reading sources are left to the [`Compiler`] and
//! [`SourceStore`] collaborators.

pub mod compiler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod registry;
pub mod source;
pub mod toolchain;
pub mod unit;
pub mod usage;
pub mod watcher;

mod generation;

#[cfg(test)]
mod test_support;

pub use compiler::{Compiled, Compiler, Executable};
pub use config::EngineConfig;
pub use context::{AmbientContext, DataContext, RequestContext, ThreadAmbient};
pub use engine::{Engine, EngineBuilder};
pub use error::{CompileError, EngineError, ScriptFailure, SourceError};
pub use registry::UnitRegistry;
pub use source::{MemorySourceStore, SourceFile, SourceStore};
pub use toolchain::Toolchain;
pub use unit::{CompiledUnit, UnitRole};
pub use usage::{UsageGuard, UsageTicket};
pub use watcher::{ChangeBatch, ChangeEvent, ChangeKind, ChangeOutcome, ChangeWatcher};

pub use kiln_metrics::{Event, Snapshot};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
