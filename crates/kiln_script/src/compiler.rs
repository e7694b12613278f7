//! QuickJS compiler collaborator

use crate::include;
use crate::runtime::ScriptRuntime;
use crate::settings::ScriptSettings;
use kiln_core::{
    Compiled, CompileError, Compiler, Executable, RequestContext, ScriptFailure, SourceStore,
};
use std::time::Instant;

/// Compiles scripts into their own QuickJS runtime each.
#[derive(Debug, Clone, Default)]
pub struct QuickJsCompiler {
    settings: ScriptSettings,
}

impl QuickJsCompiler {
    pub fn new(settings: ScriptSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ScriptSettings {
        &self.settings
    }
}

impl Compiler for QuickJsCompiler {
    fn compile(&self, path: &str, store: &dyn SourceStore) -> Result<Compiled, CompileError> {
        let started = Instant::now();
        let source = store.read(path)?;
        let expanded = include::expand(path, &source.text, store)?;
        let runtime = ScriptRuntime::load(path, &expanded.text, &self.settings)?;
        tracing::trace!(
            path,
            bytes = expanded.text.len(),
            includes = expanded.dependencies.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "loaded script into QuickJS"
        );
        Ok(Compiled::new(runtime).with_dependencies(expanded.dependencies))
    }
}

impl Executable for ScriptRuntime {
    fn run(&self, request: &mut RequestContext) -> Result<(), ScriptFailure> {
        self.call(request)
    }
}
