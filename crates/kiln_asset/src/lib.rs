//! Kiln Asset Store
//!
//! Script sources on the local filesystem.
//!
//! Script paths are store-relative and always written with a leading `/`,
//! e.g. `/pages/index.js` for `<root>/pages/index.js`. Paths that would
//! leave the root are rejected.

use kiln_core::{SourceError, SourceFile, SourceStore};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Normalize a script path to `/a/b.js` form. `None` if it climbs above
/// the root.
pub fn normalize(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
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

/// Source store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsSourceStore {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsSourceStore {
    /// Store serving `.js` files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: vec!["js".to_string()],
        }
    }

    /// Extensions `list` reports. Reads are not restricted.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a script path.
    pub fn locate(&self, path: &str) -> Result<PathBuf, SourceError> {
        let normalized = normalize(path).ok_or_else(|| SourceError::OutsideRoot {
            path: path.to_string(),
        })?;
        let mut location = self.root.clone();
        location.extend(normalized.split('/').filter(|s| !s.is_empty()));
        Ok(location)
    }

    /// Script path of a file under the root.
    pub fn script_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => segments.push(name.to_str()?.to_string()),
                _ => return None,
            }
        }
        Some(format!("/{}", segments.join("/")))
    }

    fn listed(&self, file: &Path) -> bool {
        file.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to list script directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let file = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => self.walk(&file, out),
                Ok(kind) if kind.is_file() && self.listed(&file) => {
                    if let Some(path) = self.script_path(&file) {
                        out.push(path);
                    }
                }
                _ => {}
            }
        }
    }
}

impl SourceStore for FsSourceStore {
    fn read(&self, path: &str) -> Result<SourceFile, SourceError> {
        let location = self.locate(path)?;
        let text = std::fs::read_to_string(&location).map_err(|err| match err.kind() {
            ErrorKind::NotFound => SourceError::NotFound {
                path: path.to_string(),
            },
            _ => SourceError::Io {
                path: path.to_string(),
                message: err.to_string(),
            },
        })?;
        let last_modified = std::fs::metadata(&location).and_then(|m| m.modified()).ok();
        Ok(SourceFile {
            path: path.to_string(),
            text,
            last_modified,
        })
    }

    fn last_modified(&self, path: &str) -> Option<SystemTime> {
        let location = self.locate(path).ok()?;
        std::fs::metadata(location).and_then(|m| m.modified()).ok()
    }

    fn list(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.walk(&self.root, &mut paths);
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store() -> (tempfile::TempDir, FsSourceStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("pages/parts")).expect("mkdir");
        fs::write(dir.path().join("index.js"), "response.write('i');").expect("write");
        fs::write(dir.path().join("pages/a.js"), "a").expect("write");
        fs::write(dir.path().join("pages/parts/h.js"), "h").expect("write");
        fs::write(dir.path().join("pages/notes.txt"), "not a script").expect("write");
        let store = FsSourceStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn normalizes_script_paths() {
        assert_eq!(normalize("pages//a.js").as_deref(), Some("/pages/a.js"));
        assert_eq!(normalize("/pages/./parts/../a.js").as_deref(), Some("/pages/a.js"));
        assert_eq!(normalize("/../secret"), None);
    }

    #[test]
    fn reads_with_timestamp() {
        let (_dir, store) = store();
        let file = store.read("/pages/a.js").expect("reads");
        assert_eq!(file.text, "a");
        assert!(file.last_modified.is_some());
        assert_eq!(store.last_modified("/pages/a.js"), file.last_modified);
    }

    #[test]
    fn missing_and_escaping_paths_are_distinct() {
        let (_dir, store) = store();
        assert!(matches!(store.read("/nope.js"), Err(SourceError::NotFound { .. })));
        assert!(matches!(store.read("/../etc/passwd"), Err(SourceError::OutsideRoot { .. })));
        assert_eq!(store.last_modified("/nope.js"), None);
    }

    #[test]
    fn lists_scripts_recursively() {
        let (_dir, store) = store();
        assert_eq!(store.list(), vec!["/index.js", "/pages/a.js", "/pages/parts/h.js"]);

        let store = store.with_extensions(["txt"]);
        assert_eq!(store.list(), vec!["/pages/notes.txt"]);
    }

    #[test]
    fn maps_files_back_to_script_paths() {
        let (dir, store) = store();
        let file = dir.path().join("pages").join("a.js");
        assert_eq!(store.script_path(&file).as_deref(), Some("/pages/a.js"));
        assert_eq!(store.script_path(Path::new("/elsewhere/a.js")), None);
    }
}
