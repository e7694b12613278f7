//! QuickJS runtime settings

use serde::{Deserialize, Serialize};

/// Limits applied to every runtime a compiler creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Heap limit per unit. `None` leaves QuickJS unbounded.
    pub memory_limit_bytes: Option<usize>,
    pub max_stack_bytes: Option<usize>,
    /// Run script bodies in strict mode.
    pub strict: bool,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            memory_limit_bytes: Some(32 * 1024 * 1024),
            max_stack_bytes: Some(1024 * 1024),
            strict: true,
        }
    }
}
