//! Path grant model
//!
//! Each grant list is kept as an antichain under the path-ancestor order:
//! no entry is a descendant of another entry in the same set. A broader
//! grant always subsumes the narrower ones it covers.

use std::path::{Path, PathBuf};

use crate::config::SandboxRequest;

/// An ordered set of paths in which no entry is an ancestor of another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    paths: Vec<PathBuf>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a path, keeping the set minimal
    ///
    /// The new path is dropped when an existing entry equals it or is one of
    /// its ancestors. Otherwise every existing descendant of the new path is
    /// removed and the path is appended. Comparison is by path segment, so
    /// `/a/bc` is not inside `/a/b`.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.paths.iter().any(|existing| path.starts_with(existing)) {
            return false;
        }
        self.paths.retain(|existing| !existing.starts_with(&path));
        self.paths.push(path);
        true
    }

    /// Whether `path` is granted by some entry of the set
    pub fn covers(&self, path: &Path) -> bool {
        self.paths.iter().any(|existing| path.starts_with(existing))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathBuf> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Entries in lexical order, as persisted by the container registry
    pub fn sorted(&self) -> Vec<PathBuf> {
        let mut paths = self.paths.clone();
        paths.sort();
        paths
    }

    pub fn into_vec(self) -> Vec<PathBuf> {
        self.paths
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for PathSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut set = PathSet::new();
        for path in iter {
            set.insert(path);
        }
        set
    }
}

impl<'a> IntoIterator for &'a PathSet {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}

/// Normalized filesystem grants derived from a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    readable: PathSet,
    writable: PathSet,
    ensure_exists: PathSet,
}

impl AccessPolicy {
    /// Build the policy for a request
    ///
    /// Paths are made absolute against the current directory without
    /// resolving symlinks.
    pub fn from_request(request: &SandboxRequest) -> Self {
        Self {
            readable: request.readable_paths().iter().map(|p| absolute(p)).collect(),
            writable: request.writable_paths().iter().map(|p| absolute(p)).collect(),
            ensure_exists: request
                .writable_paths_ensure_exists()
                .iter()
                .map(|p| absolute(p))
                .collect(),
        }
    }

    pub fn readable(&self) -> &PathSet {
        &self.readable
    }

    pub fn writable(&self) -> &PathSet {
        &self.writable
    }

    pub fn ensure_exists(&self) -> &PathSet {
        &self.ensure_exists
    }

    /// Writable grants including the ensure-exists directories
    pub fn all_writable(&self) -> PathSet {
        self.writable
            .iter()
            .chain(self.ensure_exists.iter())
            .cloned()
            .collect()
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
