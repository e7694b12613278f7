//! Compiler collaborator contract

use crate::context::RequestContext;
use crate::error::{CompileError, ScriptFailure};
use crate::source::SourceStore;
use std::sync::Arc;

/// A loaded, runnable representation of one script.
pub trait Executable: Send + Sync {
    fn run(&self, request: &mut RequestContext) -> Result<(), ScriptFailure>;
}

/// Output of a successful compile.
pub struct Compiled {
    pub executable: Arc<dyn Executable>,
    /// Other source paths this unit was built from. A change to any of them
    /// invalidates the unit.
    pub dependencies: Vec<String>,
}

impl Compiled {
    pub fn new(executable: impl Executable + 'static) -> Self {
        Self {
            executable: Arc::new(executable),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Turns script source into an [`Executable`].
///
/// Must be deterministic for identical source and safe to call concurrently
/// for distinct paths.
pub trait Compiler: Send + Sync {
    fn compile(&self, path: &str, store: &dyn SourceStore) -> Result<Compiled, CompileError>;

    /// Called once per unit when its registry generation is destroyed.
    fn release(&self, _path: &str) {}
}
