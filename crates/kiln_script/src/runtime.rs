//! Script runtime management
//!
//! Every compiled unit owns one QuickJS runtime and context. The script is
//! evaluated once, wrapped in a function that takes the request as JSON and
//! hands back the response as JSON, and that function is parked in the
//! context's globals for later calls.

use crate::settings::ScriptSettings;
use kiln_core::{CompileError, RequestContext, ScriptFailure};
use rquickjs::{Context, Ctx, Function, Runtime};
use serde::Deserialize;
use serde_json::{Map, Value};

const ENTRY: &str = "__kiln_entry";

/// Helpers visible to every script as `kiln`.
const PRELUDE: &str = r#"
const kiln = Object.freeze({
    fail(message, errorPage) {
        const error = new Error(String(message));
        if (errorPage !== undefined && errorPage !== null) {
            error.errorPage = String(errorPage);
        }
        throw error;
    },
});
"#;

/// Response data a script call hands back.
#[derive(Debug, Deserialize)]
struct Outcome {
    body: String,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    failure: Option<Thrown>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Thrown {
    message: String,
    #[serde(default)]
    error_page: Option<String>,
}

/// Script execution context
pub struct ScriptRuntime {
    path: String,
    context: Context,
    #[allow(dead_code)] // Kept alive for context lifetime
    runtime: Runtime,
}

impl ScriptRuntime {
    /// Evaluate `source` for `path` and keep its entry function.
    pub fn load(path: &str, source: &str, settings: &ScriptSettings) -> Result<Self, CompileError> {
        let setup = |err: rquickjs::Error| CompileError::Syntax {
            path: path.to_string(),
            message: format!("failed to set up script runtime: {err}"),
        };
        let runtime = Runtime::new().map_err(setup)?;
        if let Some(limit) = settings.memory_limit_bytes {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = settings.max_stack_bytes {
            runtime.set_max_stack_size(limit);
        }
        let context = Context::full(&runtime).map_err(setup)?;

        let wrapped = wrap(source, settings.strict);
        context.with(|ctx| -> Result<(), CompileError> {
            let syntax = |ctx: &Ctx<'_>, err: rquickjs::Error| CompileError::Syntax {
                path: path.to_string(),
                message: describe(ctx, err),
            };
            let entry: Function = ctx.eval(wrapped).map_err(|err| syntax(&ctx, err))?;
            ctx.globals().set(ENTRY, entry).map_err(|err| syntax(&ctx, err))?;
            Ok(())
        })?;

        Ok(Self {
            path: path.to_string(),
            context,
            runtime,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run the script against `request`.
    ///
    /// Output written before a failure stays in the body. Calls on one
    /// runtime are serialized by QuickJS.
    pub fn call(&self, request: &mut RequestContext) -> Result<(), ScriptFailure> {
        let input = serde_json::to_string(&*request).map_err(|err| {
            ScriptFailure::new(self.path.clone(), format!("request is not serializable: {err}"))
        })?;

        let output = self.context.with(|ctx| -> Result<String, ScriptFailure> {
            let fail = |ctx: &Ctx<'_>, err: rquickjs::Error| {
                ScriptFailure::new(self.path.clone(), describe(ctx, err))
            };
            let entry: Function = ctx.globals().get(ENTRY).map_err(|err| fail(&ctx, err))?;
            entry.call((input,)).map_err(|err| fail(&ctx, err))
        })?;

        let outcome: Outcome = serde_json::from_str(&output).map_err(|err| {
            ScriptFailure::new(self.path.clone(), format!("malformed script response: {err}"))
        })?;
        request.body = outcome.body;
        request.status = outcome.status;
        request.attributes = outcome.attributes;

        match outcome.failure {
            None => Ok(()),
            Some(thrown) => {
                let failure = ScriptFailure::new(self.path.clone(), thrown.message);
                Err(match thrown.error_page {
                    Some(page) => failure.with_error_page(page),
                    None => failure,
                })
            }
        }
    }
}

/// Turn a script body into an expression evaluating to its entry function.
fn wrap(source: &str, strict: bool) -> String {
    let directive = if strict { "\"use strict\";" } else { "" };
    format!(
        r#"(function () {{
{prelude}
const script = function (request, response) {{ {directive}
{source}
}};
return function (input) {{
    const request = JSON.parse(input);
    if (request.attributes === null || typeof request.attributes !== "object") {{
        request.attributes = {{}};
    }}
    const response = {{
        body: typeof request.body === "string" ? request.body : "",
        status: request.status === undefined ? null : request.status,
        write(text) {{ response.body += String(text); }},
    }};
    let failure = null;
    try {{
        script(request, response);
    }} catch (error) {{
        const isObject = error !== null && typeof error === "object";
        failure = {{
            message: error instanceof Error ? error.message : (isObject && "message" in error ? String(error.message) : String(error)),
            errorPage: isObject && error.errorPage != null ? String(error.errorPage) : null,
        }};
    }}
    return JSON.stringify({{
        body: response.body,
        status: typeof response.status === "number" ? response.status : null,
        attributes: request.attributes,
        failure: failure,
    }});
}};
}})()"#,
        prelude = PRELUDE,
    )
}

/// Best description of a failed QuickJS call.
fn describe(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    if let Some(text) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    format!("uncaught exception: {thrown:?}")
}
