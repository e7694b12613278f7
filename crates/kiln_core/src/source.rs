//! Source store collaborator
//!
//! The engine never touches the filesystem itself: compilers read script
//! text through a [`SourceStore`], and units consult its timestamps when the
//! modification check is enabled.

use crate::error::SourceError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Script text plus the timestamp it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub text: String,
    pub last_modified: Option<SystemTime>,
}

/// Read access to script sources.
pub trait SourceStore: Send + Sync {
    fn read(&self, path: &str) -> Result<SourceFile, SourceError>;

    /// `None` when the path does not exist.
    fn last_modified(&self, path: &str) -> Option<SystemTime>;

    /// Every script path the store currently knows about. Stores that cannot
    /// enumerate return an empty list, which disables polling.
    fn list(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory store. Each write bumps a store-local revision that doubles as
/// the timestamp, so two writes never share one.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    files: DashMap<String, (String, SystemTime)>,
    revision: AtomicU64,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(path, text);
        self
    }

    pub fn insert(&self, path: impl Into<String>, text: impl Into<String>) {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let stamp = UNIX_EPOCH + Duration::from_nanos(revision);
        self.files.insert(path.into(), (text.into(), stamp));
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }
}

impl SourceStore for MemorySourceStore {
    fn read(&self, path: &str) -> Result<SourceFile, SourceError> {
        let entry = self.files.get(path).ok_or_else(|| SourceError::NotFound {
            path: path.to_string(),
        })?;
        let (text, stamp) = entry.value();
        Ok(SourceFile {
            path: path.to_string(),
            text: text.clone(),
            last_modified: Some(*stamp),
        })
    }

    fn last_modified(&self, path: &str) -> Option<SystemTime> {
        self.files.get(path).map(|entry| entry.value().1)
    }

    fn list(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_advance_the_timestamp() {
        let store = MemorySourceStore::new().with_file("/a.js", "one");
        let first = store.last_modified("/a.js");
        store.insert("/a.js", "two");
        let second = store.last_modified("/a.js");
        assert!(second > first);
        assert_eq!(store.read("/a.js").map(|f| f.text), Ok("two".to_string()));
    }

    #[test]
    fn missing_paths_are_not_found() {
        let store = MemorySourceStore::new();
        assert_eq!(
            store.read("/nope.js"),
            Err(SourceError::NotFound {
                path: "/nope.js".into()
            })
        );
        assert!(store.last_modified("/nope.js").is_none());
        assert!(!store.remove("/nope.js"));
    }
}
