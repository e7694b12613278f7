//! One compiled script and its validity state.

use crate::compiler::Executable;
use crate::context::RequestContext;
use crate::error::{CompileError, EngineError};
use crate::toolchain::Toolchain;
use kiln_metrics::Event;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// How a unit was first asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRole {
    Script,
    ErrorPage,
}

struct Loaded {
    executable: Arc<dyn Executable>,
    dependencies: Vec<String>,
}

/// A finished compile and the source timestamp it started from.
struct Outcome {
    source_modified: Option<SystemTime>,
    result: Result<Loaded, CompileError>,
}

/// The compiled, executable form of one script path.
///
/// Compiles lazily on first execution. The outcome, success or failure, is
/// kept until the unit is invalidated; an invalid unit is never run again
/// and is replaced by a fresh one on the next lookup.
pub struct CompiledUnit {
    path: String,
    role: UnitRole,
    valid: AtomicBool,
    /// Set before the compiler first reads the store.
    compiling: AtomicBool,
    loaded: OnceCell<Outcome>,
    born: Instant,
    /// Milliseconds after `born` of the last timestamp comparison.
    last_checked_ms: AtomicU64,
}

impl CompiledUnit {
    pub fn new(path: impl Into<String>, role: UnitRole) -> Self {
        Self {
            path: path.into(),
            role,
            valid: AtomicBool::new(true),
            compiling: AtomicBool::new(false),
            loaded: OnceCell::new(),
            born: Instant::now(),
            last_checked_ms: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this unit was created by an error-page lookup.
    pub fn is_error_page(&self) -> bool {
        self.role == UnitRole::ErrorPage
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the unit stale. Monotonic: a unit is never made valid again.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.loaded.get(), Some(Outcome { result: Ok(_), .. }))
    }

    /// Whether this unit was built from `path`, directly or through an
    /// include. A unit whose compile failed on a missing include depends on
    /// that include too, so adding it clears the cached failure.
    ///
    /// While a compile is running its dependencies are unknown and it may
    /// already have read the old text of `path`, so it counts as dependent
    /// on everything.
    pub fn depends_on(&self, path: &str) -> bool {
        match self.loaded.get().map(|outcome| &outcome.result) {
            Some(Ok(loaded)) => loaded.dependencies.iter().any(|dep| dep == path),
            Some(Err(CompileError::Dependency { dependency, .. })) => dependency == path,
            Some(Err(_)) => false,
            None => self.compiling.load(Ordering::SeqCst),
        }
    }

    pub fn dependencies(&self) -> Vec<String> {
        match self.loaded.get() {
            Some(Outcome { result: Ok(loaded), .. }) => loaded.dependencies.clone(),
            _ => Vec::new(),
        }
    }

    /// Compile now if that has not happened yet.
    pub fn ensure_compiled(&self, toolchain: &Toolchain) -> Result<(), EngineError> {
        self.load(toolchain).map(|_| ())
    }

    fn load(&self, toolchain: &Toolchain) -> Result<&Loaded, EngineError> {
        let outcome = self.loaded.get_or_init(|| {
            self.compiling.store(true, Ordering::SeqCst);
            let source_modified = toolchain.store.last_modified(&self.path);
            let started = Instant::now();
            let result = match toolchain.compiler.compile(&self.path, toolchain.store.as_ref()) {
                Ok(compiled) => {
                    toolchain.stats.increment(Event::Compile);
                    tracing::debug!(
                        path = %self.path,
                        dependencies = compiled.dependencies.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "compiled unit"
                    );
                    Ok(Loaded {
                        executable: compiled.executable,
                        dependencies: compiled.dependencies,
                    })
                }
                Err(err) => {
                    toolchain.stats.increment(Event::CompileFailure);
                    tracing::error!(path = %self.path, error = %err, "compile failed");
                    Err(err)
                }
            };
            Outcome {
                source_modified,
                result,
            }
        });
        outcome
            .result
            .as_ref()
            .map_err(|err| EngineError::Compile(err.clone()))
    }

    /// Run the unit, compiling it first if needed.
    ///
    /// A script failure leaves failure markers on the request for an error
    /// page to pick up. Returns [`EngineError::StaleUnit`] without running
    /// anything if the unit was invalidated.
    pub fn execute(
        &self,
        request: &mut RequestContext,
        toolchain: &Toolchain,
    ) -> Result<(), EngineError> {
        if !self.is_valid() {
            return Err(EngineError::StaleUnit {
                path: self.path.clone(),
            });
        }
        let loaded = self.load(toolchain)?;
        toolchain.stats.increment(Event::Execute);
        loaded.executable.run(request).map_err(|failure| {
            tracing::debug!(path = %self.path, error = %failure, "script failed");
            request.record_failure(&failure);
            EngineError::Script(failure)
        })
    }

    /// Run the unit as an error page. On success the failure markers of the
    /// attempt that led here are cleared, so an outer handler does not
    /// handle the same failure twice.
    pub fn execute_error_page(
        &self,
        request: &mut RequestContext,
        toolchain: &Toolchain,
    ) -> Result<(), EngineError> {
        self.execute(request, toolchain)?;
        request.clear_failure_markers();
        Ok(())
    }

    /// Development-mode check: has the source moved since this unit was
    /// compiled? Failed compiles are checked too, so fixing a broken script
    /// is picked up. Consults the store at most once per `interval`.
    pub(crate) fn source_changed(&self, toolchain: &Toolchain, interval: Duration) -> bool {
        let Some(outcome) = self.loaded.get() else {
            return false;
        };
        let now_ms = self.born.elapsed().as_millis() as u64;
        let last = self.last_checked_ms.load(Ordering::Relaxed);
        if last != 0 && now_ms.saturating_sub(last) < interval.as_millis() as u64 {
            return false;
        }
        if self
            .last_checked_ms
            .compare_exchange(last, now_ms.max(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another thread is doing this round's comparison.
            return false;
        }
        toolchain.store.last_modified(&self.path) != outcome.source_modified
    }
}

impl std::fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("valid", &self.is_valid())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ERROR_EXCEPTION, ERROR_STATUS_CODE};
    use crate::test_support::Fixture;

    #[test]
    fn compiles_once_and_runs() {
        let fx = Fixture::new(&[("/a.js", "write:hello")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(!unit.is_compiled());

        let mut request = RequestContext::new("/a.js");
        unit.execute(&mut request, &fx.toolchain).expect("runs");
        unit.execute(&mut request, &fx.toolchain).expect("runs again");

        assert_eq!(request.body, "hellohello");
        assert_eq!(fx.compiler.compiles("/a.js"), 1);
        assert!(unit.is_compiled());
    }

    #[test]
    fn compile_failure_is_cached_until_invalidated() {
        let fx = Fixture::new(&[("/bad.js", "syntax-error")]);
        let unit = CompiledUnit::new("/bad.js", UnitRole::Script);
        let mut request = RequestContext::new("/bad.js");

        let first = unit.execute(&mut request, &fx.toolchain).unwrap_err();
        let second = unit.execute(&mut request, &fx.toolchain).unwrap_err();
        assert!(first.is_compile());
        assert_eq!(first, second);
        assert_eq!(fx.compiler.compiles("/bad.js"), 1);
    }

    #[test]
    fn invalid_unit_never_runs() {
        let fx = Fixture::new(&[("/a.js", "write:x")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(unit.invalidate());
        assert!(!unit.invalidate());

        let mut request = RequestContext::new("/a.js");
        let err = unit.execute(&mut request, &fx.toolchain).unwrap_err();
        assert!(matches!(err, EngineError::StaleUnit { .. }));
        assert_eq!(fx.compiler.compiles("/a.js"), 0);
        assert!(request.body.is_empty());
    }

    #[test]
    fn script_failure_leaves_markers_and_error_page_clears_them() {
        let fx = Fixture::new(&[
            ("/a.js", "fail:boom@/error.js"),
            ("/error.js", "write:sorry"),
        ]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        let mut request = RequestContext::new("/a.js");

        match unit.execute(&mut request, &fx.toolchain) {
            Err(EngineError::Script(failure)) => {
                assert_eq!(failure.error_page.as_deref(), Some("/error.js"));
            }
            other => panic!("expected script failure, got {other:?}"),
        }
        assert!(request.attribute(ERROR_STATUS_CODE).is_some());
        assert!(request.attribute(ERROR_EXCEPTION).is_some());

        let page = CompiledUnit::new("/error.js", UnitRole::ErrorPage);
        assert!(page.is_error_page());
        page.execute_error_page(&mut request, &fx.toolchain)
            .expect("error page runs");
        assert_eq!(request.body, "sorry");
        assert!(!request.has_failure_markers());
    }

    #[test]
    fn dependencies_are_recorded_after_compile() {
        let fx = Fixture::new(&[("/a.js", "include:/lib/util.js;write:a"), ("/lib/util.js", "")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(!unit.depends_on("/lib/util.js"));
        unit.ensure_compiled(&fx.toolchain).expect("compiles");
        assert!(unit.depends_on("/lib/util.js"));
        assert_eq!(unit.dependencies(), vec!["/lib/util.js".to_string()]);
    }

    #[test]
    fn missing_include_counts_as_dependency() {
        let fx = Fixture::new(&[("/a.js", "include:/lib/later.js")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(unit.ensure_compiled(&fx.toolchain).is_err());
        assert!(unit.depends_on("/lib/later.js"));
    }

    #[test]
    fn source_change_detected_through_store_timestamp() {
        let fx = Fixture::new(&[("/a.js", "write:1")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        unit.ensure_compiled(&fx.toolchain).expect("compiles");

        assert!(!unit.source_changed(&fx.toolchain, Duration::ZERO));
        fx.store.insert("/a.js", "write:2");
        assert!(unit.source_changed(&fx.toolchain, Duration::ZERO));
    }

    #[test]
    fn unit_compiling_during_a_change_counts_as_dependent() {
        let fx = Fixture::new(&[("/a.js", "include:/inc.js;pause"), ("/inc.js", "write:v1")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(!unit.depends_on("/inc.js"));

        std::thread::scope(|s| {
            let compiling = s.spawn(|| unit.ensure_compiled(&fx.toolchain));
            fx.compiler.gate().wait_held(1);
            assert!(unit.depends_on("/inc.js"));
            assert!(unit.depends_on("/unrelated.js"));
            fx.compiler.gate().open();
            compiling.join().expect("compile thread").expect("compiles");
        });

        assert!(unit.depends_on("/inc.js"));
        assert!(!unit.depends_on("/unrelated.js"));
    }

    #[test]
    fn failed_compile_notices_a_fixed_source() {
        let fx = Fixture::new(&[("/a.js", "syntax-error")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        assert!(unit.ensure_compiled(&fx.toolchain).is_err());

        assert!(!unit.source_changed(&fx.toolchain, Duration::ZERO));
        fx.store.insert("/a.js", "write:fixed");
        assert!(unit.source_changed(&fx.toolchain, Duration::ZERO));
    }

    #[test]
    fn source_check_is_throttled() {
        let fx = Fixture::new(&[("/a.js", "write:1")]);
        let unit = CompiledUnit::new("/a.js", UnitRole::Script);
        unit.ensure_compiled(&fx.toolchain).expect("compiles");

        assert!(!unit.source_changed(&fx.toolchain, Duration::from_secs(3600)));
        fx.store.insert("/a.js", "write:2");
        assert!(!unit.source_changed(&fx.toolchain, Duration::from_secs(3600)));
    }
}
