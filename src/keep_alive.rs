//! Keep-alive markers for ensure-exists directories
//!
//! A marker is an open temporary file inside the directory. While any marker
//! is open the directory counts as in use, both for this process and for
//! reconciliation passes of sibling invocations.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};

const MARKER_PREFIX: &str = ".kennel_keep_alive_";

/// An open marker file that keeps its directory alive
#[derive(Debug)]
pub struct KeepAlive {
    marker: NamedTempFile,
    dir: PathBuf,
}

impl KeepAlive {
    /// Place a marker inside an existing directory
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let marker = tempfile::Builder::new()
            .prefix(MARKER_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| Error::os_path("create keep-alive marker", dir, e))?;
        tracing::debug!(path = %marker.path().display(), "keep-alive: marker created");
        Ok(Self {
            marker,
            dir: dir.to_path_buf(),
        })
    }

    /// Create the directory if needed, then place a marker inside it
    ///
    /// Returns the marker and whether the directory was created by this call.
    pub fn ensure_dir(dir: impl AsRef<Path>) -> Result<(Self, bool)> {
        let dir = dir.as_ref();
        let created = match fs::create_dir(dir) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(dir).map_err(|e| Error::os_path("create directory", dir, e))?;
                true
            }
            Err(e) => return Err(Error::os_path("create directory", dir, e)),
        };
        if created {
            tracing::debug!(path = %dir.display(), "keep-alive: directory created");
        }
        Ok((Self::new(dir)?, created))
    }

    /// Directory kept alive by this marker
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the marker file
    pub fn marker_path(&self) -> &Path {
        self.marker.path()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        tracing::debug!(path = %self.marker.path().display(), "keep-alive: marker released");
    }
}

/// Whether `name` is a keep-alive marker file name
pub fn is_marker(name: &str) -> bool {
    name.starts_with(MARKER_PREFIX)
}

/// Create every ensure-exists directory and collect their markers
pub(crate) fn ensure_all<'a>(
    dirs: impl IntoIterator<Item = &'a PathBuf>,
) -> Result<Vec<(KeepAlive, bool)>> {
    dirs.into_iter().map(KeepAlive::ensure_dir).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_lives_until_drop() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("work");

        let (keep_alive, created) = KeepAlive::ensure_dir(&dir).unwrap();
        assert!(created);
        let marker = keep_alive.marker_path().to_path_buf();
        assert!(marker.exists());
        assert!(is_marker(marker.file_name().unwrap().to_str().unwrap()));

        drop(keep_alive);
        assert!(!marker.exists());
        assert!(dir.exists());
    }

    #[test]
    fn test_existing_directory_is_not_recreated() {
        let temp = tempfile::tempdir().unwrap();
        let (_first, created) = KeepAlive::ensure_dir(temp.path()).unwrap();
        assert!(!created);
    }

    #[test]
    fn test_nested_directory_is_created() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("a").join("b");
        let (_keep_alive, created) = KeepAlive::ensure_dir(&dir).unwrap();
        assert!(created);
        assert!(dir.is_dir());
    }
}
