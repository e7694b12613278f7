use thiserror::Error;

/// Errors reported by a source store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("script '{path}' not found")]
    NotFound { path: String },

    #[error("script path '{path}' escapes the source root")]
    OutsideRoot { path: String },

    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },
}

/// Source could not be turned into an executable representation.
///
/// Cloneable so a unit can keep re-surfacing the same failure until its
/// source changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("failed to compile '{path}': {message}")]
    Syntax { path: String, message: String },

    #[error("failed to resolve dependency '{dependency}' of '{path}': {source}")]
    Dependency {
        path: String,
        dependency: String,
        source: SourceError,
    },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Failure raised by compiled code while it ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script '{path}' failed: {message}")]
pub struct ScriptFailure {
    pub path: String,
    pub message: String,
    /// Unit to dispatch to instead of surfacing the failure.
    pub error_page: Option<String>,
}

impl ScriptFailure {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            error_page: None,
        }
    }

    pub fn with_error_page(mut self, error_page: impl Into<String>) -> Self {
        self.error_page = Some(error_page.into());
        self
    }
}

/// Everything `Engine::run` can report to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Script(#[from] ScriptFailure),

    #[error("script engine seems to be shut down concurrently; not calling '{path}'")]
    ShutdownRace { path: String },

    /// The unit was invalidated between lookup and execution. The engine
    /// retries internally; callers of `Engine::run` never see this.
    #[error("unit '{path}' was invalidated before it could run")]
    StaleUnit { path: String },
}

impl EngineError {
    pub fn is_compile(&self) -> bool {
        matches!(self, EngineError::Compile(_))
    }

    pub fn is_script_failure(&self) -> bool {
        matches!(self, EngineError::Script(_))
    }

    pub fn is_shutdown_race(&self) -> bool {
        matches!(self, EngineError::ShutdownRace { .. })
    }

    /// HTTP-style status a host may use when reporting this error.
    pub fn status_hint(&self) -> u16 {
        match self {
            EngineError::Compile(CompileError::Source(SourceError::NotFound { .. })) => 404,
            EngineError::Compile(_) | EngineError::Script(_) => 500,
            EngineError::ShutdownRace { .. } | EngineError::StaleUnit { .. } => 503,
        }
    }
}
