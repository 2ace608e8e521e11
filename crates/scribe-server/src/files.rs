//! The served file store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::{ServerError, ServerResult};

/// Enumerate, read-last-line, and append over one root directory.
///
/// Every request name must normalize to a direct, non-hidden child of the
/// root; anything else is rejected before touching the filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store over `root`.
    ///
    /// The directory must exist and contain at least one file.
    pub fn open(root: impl Into<PathBuf>) -> ServerResult<Self> {
        let root = lexically_normal(&root.into());
        if !root.is_dir() {
            return Err(ServerError::RootMissing {
                path: root.to_string_lossy().into_owned(),
            });
        }

        let store = Self { root };
        if store.list()?.is_empty() {
            return Err(ServerError::RootEmpty {
                path: store.root.to_string_lossy().into_owned(),
            });
        }
        Ok(store)
    }

    /// Lists the non-hidden regular files, in directory-iteration order.
    pub fn list(&self) -> ServerResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Returns the last line of the named file.
    ///
    /// The last line is the text after the last newline once a single
    /// trailing newline is discounted: `"a\nb\n"` reads as `"b"`, a file
    /// holding just `"\n"` (or nothing) reads as `""`, and `"abc"` with no
    /// newline reads as `"abc"`.
    pub fn read_last_line(&self, name: &str) -> ServerResult<String> {
        let path = self.resolve(name)?;
        let content = fs::read_to_string(&path).map_err(|source| ServerError::OpenFailed {
            name: name.to_string(),
            source,
        })?;

        let body = content.strip_suffix('\n').unwrap_or(&content);
        Ok(body.rsplit('\n').next().unwrap_or_default().to_string())
    }

    /// Appends `line` plus a trailing newline to the named file.
    pub fn append_line(&self, name: &str, line: &str) -> ServerResult<()> {
        let path = self.resolve(name)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ServerError::OpenFailed {
                name: name.to_string(),
                source,
            })?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Validates a request name down to a servable path.
    fn resolve(&self, name: &str) -> ServerResult<PathBuf> {
        let normalized = lexically_normal(&self.root.join(name));

        let direct_child = normalized.parent() == Some(self.root.as_path());
        let hidden = normalized
            .file_name()
            .map(|file| file.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if !direct_child || hidden {
            return Err(ServerError::InvalidFileAccess);
        }
        Ok(normalized)
    }

    /// The served root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Normalizes `.` and `..` components without touching the filesystem.
fn lexically_normal(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other),
        }
    }
    normal
}
