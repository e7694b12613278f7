//! Counting compiler and fixtures for unit tests.
//!
//! Scripts are `;`-separated statements:
//! `write:TEXT`, `fail:MESSAGE[@ERROR_PAGE]`, `include:PATH`, `sleep:MS`,
//! `ambient` (writes the ambient data context id), `hold` (parks on the
//! compiler's [`Gate`] while running), `pause` (parks on the gate while
//! compiling) and `syntax-error`.

use crate::compiler::{Compiled, Compiler, Executable};
use crate::context::{RequestContext, ThreadAmbient};
use crate::error::{CompileError, ScriptFailure};
use crate::source::{MemorySourceStore, SourceStore};
use crate::toolchain::Toolchain;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Step {
    Write(String),
    Fail(String, Option<String>),
    Sleep(u64),
    Ambient,
    Hold,
}

/// Lets a test park a running script until it says go.
#[derive(Default)]
pub(crate) struct Gate {
    state: Mutex<(usize, bool)>,
    changed: Condvar,
}

impl Gate {
    fn hold(&self) {
        let mut state = self.state.lock();
        state.0 += 1;
        self.changed.notify_all();
        while !state.1 {
            self.changed.wait(&mut state);
        }
    }

    /// Block until `count` scripts are parked.
    pub(crate) fn wait_held(&self, count: usize) {
        let mut state = self.state.lock();
        while state.0 < count {
            self.changed.wait(&mut state);
        }
    }

    pub(crate) fn open(&self) {
        self.state.lock().1 = true;
        self.changed.notify_all();
    }
}

struct ScriptedUnit {
    path: String,
    steps: Vec<Step>,
    gate: Arc<Gate>,
}

impl Executable for ScriptedUnit {
    fn run(&self, request: &mut RequestContext) -> Result<(), ScriptFailure> {
        for step in &self.steps {
            match step {
                Step::Write(text) => request.write(text),
                Step::Sleep(ms) => std::thread::sleep(Duration::from_millis(*ms)),
                Step::Hold => self.gate.hold(),
                Step::Ambient => {
                    let id = ThreadAmbient::current().map(|c| c.id).unwrap_or_default();
                    request.write(&id);
                }
                Step::Fail(message, page) => {
                    let failure = ScriptFailure::new(self.path.clone(), message.clone());
                    return Err(match page {
                        Some(page) => failure.with_error_page(page.clone()),
                        None => failure,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct ScriptedCompiler {
    compiles: DashMap<String, usize>,
    released: DashMap<String, usize>,
    delay: Duration,
    gate: Arc<Gate>,
}

impl ScriptedCompiler {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    pub(crate) fn compiles(&self, path: &str) -> usize {
        self.compiles.get(path).map(|e| *e.value()).unwrap_or(0)
    }

    pub(crate) fn total_compiles(&self) -> usize {
        self.compiles.iter().map(|e| *e.value()).sum()
    }

    pub(crate) fn releases(&self, path: &str) -> usize {
        self.released.get(path).map(|e| *e.value()).unwrap_or(0)
    }

    fn parse(
        &self,
        path: &str,
        text: &str,
        store: &dyn SourceStore,
        steps: &mut Vec<Step>,
        dependencies: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        for statement in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (op, arg) = statement.split_once(':').unwrap_or((statement, ""));
            match op {
                "write" => steps.push(Step::Write(arg.to_string())),
                "sleep" => steps.push(Step::Sleep(arg.parse().unwrap_or(0))),
                "ambient" => steps.push(Step::Ambient),
                "hold" => steps.push(Step::Hold),
                "pause" => self.gate.hold(),
                "fail" => {
                    let (message, page) = match arg.split_once('@') {
                        Some((message, page)) => (message, Some(page.to_string())),
                        None => (arg, None),
                    };
                    steps.push(Step::Fail(message.to_string(), page));
                }
                "include" => {
                    let included = store.read(arg).map_err(|source| CompileError::Dependency {
                        path: path.to_string(),
                        dependency: arg.to_string(),
                        source,
                    })?;
                    dependencies.push(arg.to_string());
                    self.parse(path, &included.text, store, steps, dependencies)?;
                }
                _ => {
                    return Err(CompileError::Syntax {
                        path: path.to_string(),
                        message: format!("unknown statement '{statement}'"),
                    })
                }
            }
        }
        Ok(())
    }
}

impl Compiler for ScriptedCompiler {
    fn compile(&self, path: &str, store: &dyn SourceStore) -> Result<Compiled, CompileError> {
        *self.compiles.entry(path.to_string()).or_insert(0) += 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let source = store.read(path)?;
        let mut steps = Vec::new();
        let mut dependencies = Vec::new();
        self.parse(path, &source.text, store, &mut steps, &mut dependencies)?;
        Ok(Compiled::new(ScriptedUnit {
            path: path.to_string(),
            steps,
            gate: Arc::clone(&self.gate),
        })
        .with_dependencies(dependencies))
    }

    fn release(&self, path: &str) {
        *self.released.entry(path.to_string()).or_insert(0) += 1;
    }
}

pub(crate) struct Fixture {
    pub toolchain: Arc<Toolchain>,
    pub compiler: Arc<ScriptedCompiler>,
    pub store: Arc<MemorySourceStore>,
}

impl Fixture {
    pub(crate) fn new(files: &[(&str, &str)]) -> Self {
        Self::with_compiler(files, ScriptedCompiler::default())
    }

    pub(crate) fn with_compiler(files: &[(&str, &str)], compiler: ScriptedCompiler) -> Self {
        let store = Arc::new(MemorySourceStore::new());
        for (path, text) in files {
            store.insert(*path, *text);
        }
        let compiler = Arc::new(compiler);
        let toolchain = Arc::new(Toolchain::new(compiler.clone(), store.clone()));
        Self {
            toolchain,
            compiler,
            store,
        }
    }
}
