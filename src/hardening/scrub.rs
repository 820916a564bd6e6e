//! Removal of path-like values from registered process state

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

static TARGETS: Mutex<Vec<Arc<Mutex<dyn PathScrub + Send>>>> = Mutex::new(Vec::new());
static EXCEPTIONS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// A value that may carry filesystem paths
pub trait PathScrub {
    /// Whether any part of the value looks like a path
    fn holds_path(&self) -> bool;

    /// Drop the path-like content
    fn scrub(&mut self);
}

/// Whether `value` looks like an absolute path on any platform
///
/// Matches POSIX absolute paths, drive-letter paths and UNC paths, unless
/// the value was registered with [`add_path_exception`].
pub fn is_potential_path(value: &str) -> bool {
    let looks_like_path =
        value.starts_with('/') || value.starts_with("\\\\") || value.contains(":\\");
    looks_like_path
        && !EXCEPTIONS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(value)
}

/// Exempt an exact value from path scrubbing
pub fn add_path_exception(value: impl Into<String>) {
    EXCEPTIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(value.into());
}

/// Register shared state for the `ScrubPaths` safeguard
pub fn register_scrub_target<T>(target: Arc<Mutex<T>>)
where
    T: PathScrub + Send + 'static,
{
    TARGETS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(target);
}

/// Scrub every registered target, returning how many held paths
pub(crate) fn scrub_registered() -> usize {
    let targets = TARGETS.lock().unwrap_or_else(PoisonError::into_inner);
    let mut scrubbed = 0;
    for target in targets.iter() {
        let mut value = target.lock().unwrap_or_else(PoisonError::into_inner);
        if value.holds_path() {
            value.scrub();
            scrubbed += 1;
        }
    }
    scrubbed
}

impl PathScrub for String {
    fn holds_path(&self) -> bool {
        is_potential_path(self)
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            self.clear();
        }
    }
}

impl PathScrub for PathBuf {
    fn holds_path(&self) -> bool {
        is_potential_path(&self.to_string_lossy())
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            *self = PathBuf::new();
        }
    }
}

impl<T: PathScrub> PathScrub for Option<T> {
    fn holds_path(&self) -> bool {
        self.as_ref().is_some_and(PathScrub::holds_path)
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            *self = None;
        }
    }
}

impl<T: PathScrub> PathScrub for Vec<T> {
    fn holds_path(&self) -> bool {
        self.iter().any(PathScrub::holds_path)
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            self.clear();
        }
    }
}

impl<T: PathScrub> PathScrub for BTreeMap<String, T> {
    fn holds_path(&self) -> bool {
        self.iter().any(|(k, v)| is_potential_path(k) || v.holds_path())
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            self.clear();
        }
    }
}

impl<T: PathScrub, S: BuildHasher> PathScrub for HashMap<String, T, S> {
    fn holds_path(&self) -> bool {
        self.iter().any(|(k, v)| is_potential_path(k) || v.holds_path())
    }

    fn scrub(&mut self) {
        if self.holds_path() {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_heuristics() {
        assert!(is_potential_path("/usr/lib"));
        assert!(is_potential_path("C:\\Windows"));
        assert!(is_potential_path("\\\\server\\share"));
        assert!(!is_potential_path("relative/dir"));
        assert!(!is_potential_path("plain text"));
        assert!(!is_potential_path("https://example.com"));
    }

    #[test]
    fn test_exceptions_are_kept() {
        add_path_exception("/kennel-test-exception");
        assert!(!is_potential_path("/kennel-test-exception"));
        assert!(is_potential_path("/kennel-test-exception/child"));
    }

    #[test]
    fn test_scrub_values() {
        let mut text = "/home/user".to_string();
        text.scrub();
        assert!(text.is_empty());

        let mut maybe = Some(PathBuf::from("/etc/passwd"));
        maybe.scrub();
        assert!(maybe.is_none());

        let mut list = vec!["a".to_string(), "D:\\data".to_string()];
        list.scrub();
        assert!(list.is_empty());

        let mut clean = vec!["a".to_string()];
        clean.scrub();
        assert_eq!(clean.len(), 1);

        let mut map = BTreeMap::from([("home".to_string(), "/root".to_string())]);
        map.scrub();
        assert!(map.is_empty());
    }

    #[test]
    fn test_registered_targets_are_scrubbed() {
        let target = Arc::new(Mutex::new(vec![PathBuf::from("/srv/secret")]));
        register_scrub_target(target.clone());
        assert!(scrub_registered() >= 1);
        assert!(target.lock().unwrap().is_empty());
    }
}
