//! Cross-process exclusive lock around persisted sandbox state
//!
//! The critical section covers reading state, diffing, applying OS changes
//! and persisting the result. All sandbox ids share the one lock.

#[cfg(unix)]
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Held for the duration of a provisioning critical section
#[derive(Debug)]
pub(crate) struct GlobalLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<std::fs::File>,
    #[cfg(unix)]
    path: PathBuf,
    #[cfg(windows)]
    mutex: windows::Win32::Foundation::HANDLE,
}

#[cfg(unix)]
impl GlobalLock {
    /// Block until the advisory lock on `path` is ours
    pub(crate) fn file(path: &Path) -> Result<Self> {
        use nix::fcntl::{Flock, FlockArg};

        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::os_path("open lock file", path, e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::os_path("lock", path, std::io::Error::from(errno))
        })?;
        tracing::debug!(path = %path.display(), "lock: acquired");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(windows)]
impl GlobalLock {
    /// Block until the named mutex is ours
    pub(crate) fn named(name: &str) -> Result<Self> {
        use windows::Win32::Foundation::{FALSE, WAIT_ABANDONED, WAIT_OBJECT_0};
        use windows::Win32::System::Threading::{CreateMutexW, INFINITE, WaitForSingleObject};
        use windows::core::HSTRING;

        let mutex = unsafe { CreateMutexW(None, FALSE, &HSTRING::from(name)) }
            .map_err(|e| Error::os("create mutex", std::io::Error::from(e)))?;
        let wait = unsafe { WaitForSingleObject(mutex, INFINITE) };
        if wait != WAIT_OBJECT_0 && wait != WAIT_ABANDONED {
            let err = std::io::Error::last_os_error();
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(mutex);
            }
            return Err(Error::os("wait for mutex", err));
        }
        tracing::debug!(name, "lock: acquired");
        Ok(Self { mutex })
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        tracing::debug!(path = %self.path.display(), "lock: released");
        #[cfg(windows)]
        unsafe {
            use windows::Win32::Foundation::CloseHandle;
            use windows::Win32::System::Threading::ReleaseMutex;
            let _ = ReleaseMutex(self.mutex);
            let _ = CloseHandle(self.mutex);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");

        let first = GlobalLock::file(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let flag = acquired.clone();
        let contender_path = path.clone();
        let contender = std::thread::spawn(move || {
            let _second = GlobalLock::file(&contender_path).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        contender.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
