//! Per-file diagnostics as last published by the server.
//!
//! `publishDiagnostics` always carries the complete list for a file, so the
//! store replaces rather than merges.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::types::{Diagnostic, DiagnosticsSnapshot};

#[derive(Default)]
pub(crate) struct DiagnosticsStore {
    files: BTreeMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    /// Returns whether the stored list for `path` changed.
    pub(crate) fn replace(&mut self, path: PathBuf, items: Vec<Diagnostic>) -> bool {
        if items.is_empty() {
            return self.files.remove(&path).is_some();
        }
        match self.files.get_mut(&path) {
            Some(existing) if *existing == items => false,
            Some(existing) => {
                *existing = items;
                true
            }
            None => {
                self.files.insert(path, items);
                true
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.files.clear();
    }

    /// Files with errors come first; within each group paths stay sorted.
    pub(crate) fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<_> = self
            .files
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();
        files.sort_by_key(|(_, items)| !items.iter().any(|d| d.severity().is_error()));
        DiagnosticsSnapshot::new(files)
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Whether `path` lies inside `root` once `..` segments are resolved.
pub(crate) fn is_within(root: &Path, path: &Path) -> bool {
    normalize_path(path).starts_with(root)
}
