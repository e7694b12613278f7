//! Per-request state and the ambient execution context.

use crate::error::ScriptFailure;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;

/// Status code recorded for a failed script.
pub const ERROR_STATUS_CODE: &str = "kiln.error.status_code";
/// Path of the script that failed.
pub const ERROR_REQUEST_URI: &str = "kiln.error.request_uri";
/// Failure message visible to error pages.
pub const ERROR_EXCEPTION: &str = "kiln.error.exception";
/// Failure message as raised by the script itself.
pub const SCRIPT_EXCEPTION: &str = "kiln.script.exception";

/// Data-access/session context a request runs under.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataContext {
    pub id: String,
    #[serde(default)]
    pub user: Option<String>,
}

impl DataContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: None,
        }
    }
}

/// Everything a compiled unit can see and change about the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub script_path: String,
    #[serde(default)]
    pub data_context: Option<DataContext>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: String,
}

impl RequestContext {
    pub fn new(script_path: impl Into<String>) -> Self {
        Self {
            script_path: script_path.into(),
            ..Self::default()
        }
    }

    pub fn with_data_context(mut self, data_context: DataContext) -> Self {
        self.data_context = Some(data_context);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn write(&mut self, text: &str) {
        self.body.push_str(text);
    }

    /// Leave failure markers for an error page to inspect.
    pub fn record_failure(&mut self, failure: &ScriptFailure) {
        self.set_attribute(ERROR_STATUS_CODE, 500);
        self.set_attribute(ERROR_REQUEST_URI, failure.path.clone());
        self.set_attribute(ERROR_EXCEPTION, failure.message.clone());
        self.set_attribute(SCRIPT_EXCEPTION, failure.message.clone());
    }

    /// Remove the markers left by `record_failure` once an error page has
    /// handled them.
    ///
    /// The error exception is only dropped while it still is the one the
    /// script raised; an error page inside an include may have replaced it.
    pub fn clear_failure_markers(&mut self) {
        let script_exception = self.remove_attribute(SCRIPT_EXCEPTION);
        if script_exception.is_some() && self.attribute(ERROR_EXCEPTION) == script_exception.as_ref() {
            self.remove_attribute(ERROR_EXCEPTION);
        }
        self.remove_attribute(ERROR_STATUS_CODE);
        self.remove_attribute(ERROR_REQUEST_URI);
    }

    pub fn has_failure_markers(&self) -> bool {
        [ERROR_STATUS_CODE, ERROR_REQUEST_URI, ERROR_EXCEPTION, SCRIPT_EXCEPTION]
            .iter()
            .any(|name| self.attributes.contains_key(*name))
    }
}

/// Execution context collaborator: makes a request's [`DataContext`] the
/// ambient one for the duration of a call.
pub trait AmbientContext: Send + Sync {
    /// Install `next` and return whatever was active before.
    fn install(&self, next: Option<DataContext>) -> Option<DataContext>;

    /// Put back a value previously returned by `install`.
    fn restore(&self, previous: Option<DataContext>);
}

thread_local! {
    static CURRENT: RefCell<Option<DataContext>> = const { RefCell::new(None) };
}

/// Thread-local ambient context.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadAmbient;

impl ThreadAmbient {
    /// The data context installed on this thread, if any.
    pub fn current() -> Option<DataContext> {
        CURRENT.with(|current| current.borrow().clone())
    }
}

impl AmbientContext for ThreadAmbient {
    fn install(&self, next: Option<DataContext>) -> Option<DataContext> {
        CURRENT.with(|current| current.replace(next))
    }

    fn restore(&self, previous: Option<DataContext>) {
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Installs an ambient context and restores the previous one on drop, so
/// every exit path (including unwinding) puts it back.
pub(crate) struct AmbientScope<'a> {
    ambient: &'a dyn AmbientContext,
    previous: Option<Option<DataContext>>,
}

impl<'a> AmbientScope<'a> {
    pub(crate) fn enter(ambient: &'a dyn AmbientContext, next: Option<DataContext>) -> Self {
        let previous = ambient.install(next);
        Self {
            ambient,
            previous: Some(previous),
        }
    }
}

impl Drop for AmbientScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.ambient.restore(previous);
        }
    }
}
