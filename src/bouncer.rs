// FILE: src/bouncer.rs
//! The Bouncer: decides which filesystem paths are worth a second look.
//!
//! Noise is defined as:
//! 1. Editor swap and temp files (`.swp`, `.tmp`, trailing `~`)
//! 2. Paths that resolve outside the watched root
//! 3. Anything inside a hidden directory below the root
//! 4. Extensions missing from the allow-list

use std::path::{Component, Path, PathBuf};

const TEMP_SUFFIXES: &[&str] = &[".swp", ".tmp", "~"];

pub struct Bouncer;

impl Bouncer {
    /// Temp files are ignored unconditionally, whatever the allow-list says.
    pub fn is_temp_file(path: &Path) -> bool {
        let lower = path.to_string_lossy().to_lowercase();
        TEMP_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
    }

    /// Component-wise containment check. Both paths must already be resolved.
    pub fn is_within(root: &Path, path: &Path) -> bool {
        path.starts_with(root)
    }

    /// True if a directory between `root` and `path` starts with a dot.
    /// The root's own ancestors don't count.
    pub fn in_hidden_dir(root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else { return false };
        let Some(parent) = relative.parent() else { return false };
        parent
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.')))
    }

    /// Resolves symlinks. Deleted files can't be canonicalized, so fall back
    /// to resolving the parent directory and re-attaching the file name.
    pub fn resolve(path: &Path) -> PathBuf {
        if let Ok(real) = std::fs::canonicalize(path) {
            return real;
        }
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => std::fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf()),
            _ => path.to_path_buf(),
        }
    }
}

/// Lowercased extension with its leading dot, e.g. `.png`.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

/// Normalized extension allow-list. An empty list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    extensions: Vec<String>,
}

impl AllowList {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self { extensions: crate::config::normalize_extensions(extensions) }
    }

    pub fn allows(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match extension_of(path) {
            Some(ext) => self.extensions.iter().any(|allowed| *allowed == ext),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
