//! `// @include` directives
//!
//! A line of the form `// @include /lib/util.js` is replaced by the text of
//! the named script, expanded recursively. Relative paths resolve against
//! the including script's directory. Each file is inlined at most once per
//! unit, which also breaks include cycles.

use kiln_core::{CompileError, SourceError, SourceStore};

const DIRECTIVE: &str = "@include";

/// Script text with its includes inlined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expanded {
    pub text: String,
    /// Included paths in first-seen order, without the root script.
    pub dependencies: Vec<String>,
}

/// The target of an include directive on `line`, if it is one.
pub fn directive(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("//")?.trim_start();
    let target = rest.strip_prefix(DIRECTIVE)?;
    // `@includes` and friends are ordinary comments.
    if !target.starts_with(char::is_whitespace) {
        return None;
    }
    let target = target.trim().trim_matches(|c| c == '"' || c == '\'');
    (!target.is_empty()).then_some(target)
}

/// Resolve `target` as written in `base` to an absolute, normalized path.
/// `None` when it climbs above the root.
pub fn resolve(base: &str, target: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    if !target.starts_with('/') {
        segments.extend(base.split('/').filter(|s| !s.is_empty()));
        // Drop the file name of the including script.
        segments.pop();
    }
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(format!("/{}", segments.join("/")))
}

/// Expand every include reachable from `path`, whose text is `text`.
pub fn expand(path: &str, text: &str, store: &dyn SourceStore) -> Result<Expanded, CompileError> {
    let mut expanded = Expanded {
        text: String::with_capacity(text.len()),
        dependencies: Vec::new(),
    };
    let mut seen = vec![path.to_string()];
    expand_into(path, path, text, store, &mut seen, &mut expanded)?;
    Ok(expanded)
}

fn expand_into(
    root: &str,
    current: &str,
    text: &str,
    store: &dyn SourceStore,
    seen: &mut Vec<String>,
    out: &mut Expanded,
) -> Result<(), CompileError> {
    for line in text.lines() {
        let Some(target) = directive(line) else {
            out.text.push_str(line);
            out.text.push('\n');
            continue;
        };

        let dependency = resolve(current, target).ok_or_else(|| CompileError::Dependency {
            path: root.to_string(),
            dependency: target.to_string(),
            source: SourceError::OutsideRoot {
                path: target.to_string(),
            },
        })?;
        if seen.contains(&dependency) {
            out.text.push('\n');
            continue;
        }
        seen.push(dependency.clone());

        let included = store.read(&dependency).map_err(|source| CompileError::Dependency {
            path: root.to_string(),
            dependency: dependency.clone(),
            source,
        })?;
        out.dependencies.push(dependency.clone());
        expand_into(root, &dependency, &included.text, store, seen, out)?;
    }
    Ok(())
}
