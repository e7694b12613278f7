//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for invalidation and teardown. Every field has a default so a
/// partial settings file deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Extensions of shared dependency files. A change to one of these may
    /// affect any compiled unit, so it renews the whole registry.
    pub shared_extensions: Vec<String>,
    /// Explicit marker path meaning "a shared dependency changed".
    pub shared_marker: String,
    /// Namespace of the compiler's artifact cache. Clearing it (or an
    /// ancestor) renews the registry.
    pub compiler_namespace: String,
    /// Compare source timestamps on lookup (development mode).
    pub modification_check: bool,
    pub modification_test_interval_ms: u64,
    /// Log a warning when a retired registry has not drained after this long.
    pub drain_warn_after_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shared_extensions: vec!["lib".to_string(), "tld".to_string(), "tag".to_string()],
            shared_marker: "/.kiln/shared".to_string(),
            compiler_namespace: "/kiln/compiled".to_string(),
            modification_check: false,
            modification_test_interval_ms: 4_000,
            drain_warn_after_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Whether a change to `path` invalidates assumptions every unit may
    /// have been compiled under.
    pub fn is_shared(&self, path: &str) -> bool {
        if path == self.shared_marker {
            return true;
        }
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .shared_extensions
                .iter()
                .any(|shared| shared.trim_start_matches('.').eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    /// Whether clearing `namespace` in the compiler cache wipes our artifacts.
    pub fn clears_compiler_cache(&self, namespace: &str) -> bool {
        let namespace = namespace.trim_end_matches('/');
        let ours = self.compiler_namespace.trim_end_matches('/');
        namespace.is_empty()
            || ours == namespace
            || ours
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Fingerprint of every setting that affects what a compiled unit
    /// depends on. When it changes, existing units can no longer be trusted.
    pub fn config_key(&self) -> String {
        let mut extensions: Vec<String> = self
            .shared_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        extensions.sort();
        extensions.dedup();
        format!(
            "ext={};marker={};ns={};modcheck={}",
            extensions.join(","),
            self.shared_marker,
            self.compiler_namespace,
            self.modification_check
        )
    }

    pub fn modification_test_interval(&self) -> Duration {
        Duration::from_millis(self.modification_test_interval_ms)
    }

    pub fn drain_warn_after(&self) -> Duration {
        Duration::from_millis(self.drain_warn_after_ms)
    }
}
