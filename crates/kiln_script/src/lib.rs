//! Kiln Scripting
//!
//! JavaScript units via QuickJS.
//!
//! ## Script API
//!
//! A script is the body of a function with two parameters:
//!
//! - `request`: the request context as plain data (`script_path`,
//!   `data_context`, `attributes`, `status`, `body`). Changes to
//!   `request.attributes` are written back.
//! - `response`: `response.write(text)` appends to the body and
//!   `response.status` sets the status.
//!
//! Throwing fails the script. `kiln.fail(message, errorPage)` throws a
//! failure that names an error page to dispatch to instead.
//!
//! `// @include /lib/util.js` lines inline other scripts; the unit is
//! recompiled when any of them changes.

pub mod compiler;
pub mod include;
pub mod runtime;
pub mod settings;

pub use compiler::QuickJsCompiler;
pub use runtime::ScriptRuntime;
pub use settings::ScriptSettings;

pub use rquickjs;
