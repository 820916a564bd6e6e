//! In-process hardening for sandboxed workers
//!
//! A worker calls [`Hardening::apply`] on itself before running untrusted
//! code. Steps run in order and the first failure stops the pipeline, so a
//! process is never left running half-hardened without an error.
//!
//! Identity and resource steps come first. The syscall filter and
//! filesystem lockdown come last because they forbid the calls the earlier
//! steps make.

mod scrub;
#[cfg(target_os = "linux")]
mod seccomp;

pub use scrub::{PathScrub, add_path_exception, is_potential_path, register_scrub_target};

use crate::error::{Error, Result};

/// Which syscall allow-list to install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallProfile {
    /// Enough for ordinary programs, including spawning children
    Default,
    /// Plain I/O on already open descriptors only
    Strict,
}

/// One hardening step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safeguard {
    /// Linux seccomp allow-list, denied calls fail with `EACCES`
    SyscallFilter(SyscallProfile),
    /// Linux Landlock ruleset denying all filesystem access
    RestrictFilesystem,
    /// FreeBSD capability mode
    EnterCapabilityMode,
    ClearEnvironment,
    /// Empty path-like values in registered scrub targets
    ScrubPaths,
    /// Forget cached tool and runtime lookups
    ResetPlatformCache,
    /// Close every descriptor above stderr
    CloseInheritedHandles,
    DeelevateGroup,
    DeelevateUser,
}

impl Safeguard {
    pub fn name(&self) -> &'static str {
        match self {
            Safeguard::SyscallFilter(_) => "syscall filter",
            Safeguard::RestrictFilesystem => "restrict filesystem",
            Safeguard::EnterCapabilityMode => "capability mode",
            Safeguard::ClearEnvironment => "clear environment",
            Safeguard::ScrubPaths => "scrub paths",
            Safeguard::ResetPlatformCache => "reset platform cache",
            Safeguard::CloseInheritedHandles => "close inherited handles",
            Safeguard::DeelevateGroup => "de-elevate group",
            Safeguard::DeelevateUser => "de-elevate user",
        }
    }

    /// Whether this step can run on the current platform
    pub fn is_supported(&self) -> bool {
        match self {
            Safeguard::SyscallFilter(_) | Safeguard::RestrictFilesystem => {
                cfg!(target_os = "linux")
            }
            Safeguard::EnterCapabilityMode => cfg!(target_os = "freebsd"),
            Safeguard::CloseInheritedHandles
            | Safeguard::DeelevateGroup
            | Safeguard::DeelevateUser => cfg!(unix),
            Safeguard::ClearEnvironment | Safeguard::ScrubPaths | Safeguard::ResetPlatformCache => {
                true
            }
        }
    }

    /// Run this step once
    pub fn apply(&self) -> Result<()> {
        if !self.is_supported() {
            return Err(self.failed("not supported on this platform"));
        }
        match self {
            Safeguard::SyscallFilter(profile) => install_syscall_filter(*profile),
            Safeguard::RestrictFilesystem => restrict_filesystem(),
            Safeguard::EnterCapabilityMode => enter_capability_mode(),
            Safeguard::ClearEnvironment => {
                clear_environment();
                Ok(())
            }
            Safeguard::ScrubPaths => {
                let scrubbed = scrub::scrub_registered();
                tracing::debug!(scrubbed, "hardening: scrubbed registered paths");
                Ok(())
            }
            Safeguard::ResetPlatformCache => {
                crate::platform::invalidate_probe();
                #[cfg(feature = "python")]
                crate::python::invalidate_runtime_paths();
                Ok(())
            }
            Safeguard::CloseInheritedHandles => close_inherited_handles(),
            Safeguard::DeelevateGroup => deelevate_group(),
            Safeguard::DeelevateUser => deelevate_user(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> Error {
        Error::Hardening {
            step: self.name(),
            reason: reason.into(),
        }
    }
}

/// An ordered list of safeguards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hardening {
    steps: Vec<Safeguard>,
}

impl Hardening {
    /// A custom pipeline, run in the given order
    pub fn new(steps: impl IntoIterator<Item = Safeguard>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// The default pipeline for this platform
    pub fn default_set() -> Self {
        Self::supported([
            Safeguard::ClearEnvironment,
            Safeguard::DeelevateGroup,
            Safeguard::DeelevateUser,
            Safeguard::SyscallFilter(SyscallProfile::Default),
        ])
    }

    /// Every safeguard available on this platform, with the strict filter
    pub fn exhaustive() -> Self {
        Self::supported([
            Safeguard::CloseInheritedHandles,
            Safeguard::ScrubPaths,
            Safeguard::ResetPlatformCache,
            Safeguard::ClearEnvironment,
            Safeguard::DeelevateGroup,
            Safeguard::DeelevateUser,
            Safeguard::RestrictFilesystem,
            Safeguard::EnterCapabilityMode,
            Safeguard::SyscallFilter(SyscallProfile::Strict),
        ])
    }

    fn supported(steps: impl IntoIterator<Item = Safeguard>) -> Self {
        Self::new(steps.into_iter().filter(Safeguard::is_supported))
    }

    pub fn steps(&self) -> &[Safeguard] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure
    pub fn apply(&self) -> Result<()> {
        for step in &self.steps {
            tracing::debug!(step = step.name(), "hardening: applying");
            step.apply()?;
        }
        tracing::info!(steps = self.steps.len(), "hardening: complete");
        Ok(())
    }
}

fn clear_environment() {
    for (key, _) in std::env::vars_os() {
        // SAFETY: the pipeline runs before the worker starts other threads.
        unsafe { std::env::remove_var(key) };
    }
}

#[cfg(target_os = "linux")]
fn install_syscall_filter(profile: SyscallProfile) -> Result<()> {
    seccomp::install(profile)
}

#[cfg(not(target_os = "linux"))]
fn install_syscall_filter(profile: SyscallProfile) -> Result<()> {
    Err(Safeguard::SyscallFilter(profile).failed("requires Linux"))
}

#[cfg(target_os = "linux")]
fn restrict_filesystem() -> Result<()> {
    use landlock::{ABI, Access, AccessFs, Ruleset, RulesetAttr, RulesetStatus};

    let failed = |e: landlock::RulesetError| Safeguard::RestrictFilesystem.failed(e.to_string());
    let status = Ruleset::default()
        .handle_access(AccessFs::from_all(ABI::V4))
        .map_err(failed)?
        .create()
        .map_err(failed)?
        .restrict_self()
        .map_err(failed)?;
    match status.ruleset {
        RulesetStatus::NotEnforced => {
            tracing::warn!("hardening: kernel has no Landlock support, filesystem left open");
        }
        RulesetStatus::PartiallyEnforced | RulesetStatus::FullyEnforced => {
            tracing::debug!(status = ?status.ruleset, "hardening: filesystem locked down");
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn restrict_filesystem() -> Result<()> {
    Err(Safeguard::RestrictFilesystem.failed("requires Linux"))
}

#[cfg(target_os = "freebsd")]
fn enter_capability_mode() -> Result<()> {
    // SAFETY: cap_enter takes no arguments and only changes process state.
    if unsafe { libc::cap_enter() } != 0 {
        return Err(Safeguard::EnterCapabilityMode.failed(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
fn enter_capability_mode() -> Result<()> {
    Err(Safeguard::EnterCapabilityMode.failed("requires FreeBSD"))
}

#[cfg(unix)]
fn close_inherited_handles() -> Result<()> {
    use nix::unistd::{SysconfVar, close, sysconf};

    // Collect first; the directory listing holds a descriptor of its own.
    let listed: Option<Vec<i32>> = std::fs::read_dir("/dev/fd").ok().map(|entries| {
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    });
    let fds = match listed {
        Some(fds) if fds.iter().any(|&fd| fd > 2) => fds,
        _ => {
            let max = sysconf(SysconfVar::OPEN_MAX)
                .ok()
                .flatten()
                .unwrap_or(1024)
                .min(i32::MAX as libc::c_long) as i32;
            (3..max).collect()
        }
    };

    let mut closed = 0;
    for fd in fds.into_iter().filter(|&fd| fd > 2) {
        match close(fd) {
            Ok(()) => closed += 1,
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => {
                return Err(Safeguard::CloseInheritedHandles.failed(format!("close({fd}): {e}")));
            }
        }
    }
    tracing::debug!(closed, "hardening: closed inherited descriptors");
    Ok(())
}

#[cfg(not(unix))]
fn close_inherited_handles() -> Result<()> {
    Err(Safeguard::CloseInheritedHandles.failed("requires a unix host"))
}

/// Range random fallback ids are drawn from
#[cfg(unix)]
const FALLBACK_ID_RANGE: std::ops::Range<u32> = 30000..60000;

#[cfg(unix)]
fn unused_id(taken: impl Fn(u32) -> bool) -> Option<u32> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    (0..64)
        .map(|_| rng.gen_range(FALLBACK_ID_RANGE))
        .find(|&id| !taken(id))
}

#[cfg(unix)]
fn deelevate_group() -> Result<()> {
    use nix::unistd::{Gid, Group, getegid, geteuid, setgid};

    let step = Safeguard::DeelevateGroup;
    if !geteuid().is_root() && getegid().as_raw() != 0 {
        return Ok(());
    }
    let gid = ["nogroup", "nobody"]
        .iter()
        .find_map(|name| Group::from_name(name).ok().flatten())
        .map(|group| group.gid)
        .or_else(|| {
            unused_id(|id| matches!(Group::from_gid(Gid::from_raw(id)), Ok(Some(_))))
                .map(Gid::from_raw)
        })
        .ok_or_else(|| step.failed("no unprivileged group available"))?;

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    nix::unistd::setgroups(&[gid]).map_err(|e| step.failed(e.to_string()))?;
    setgid(gid).map_err(|e| step.failed(e.to_string()))?;
    tracing::debug!(gid = gid.as_raw(), "hardening: group de-elevated");
    Ok(())
}

#[cfg(unix)]
fn deelevate_user() -> Result<()> {
    use nix::unistd::{Uid, User, geteuid, getuid, setuid};

    let step = Safeguard::DeelevateUser;
    if !geteuid().is_root() && !getuid().is_root() {
        return Ok(());
    }
    let uid = User::from_name("nobody")
        .ok()
        .flatten()
        .map(|user| user.uid)
        .or_else(|| {
            unused_id(|id| matches!(User::from_uid(Uid::from_raw(id)), Ok(Some(_))))
                .map(Uid::from_raw)
        })
        .ok_or_else(|| step.failed("no unprivileged user available"))?;

    setuid(uid).map_err(|e| step.failed(e.to_string()))?;
    if geteuid().is_root() {
        return Err(step.failed("still running as root after setuid"));
    }
    tracing::debug!(uid = uid.as_raw(), "hardening: user de-elevated");
    Ok(())
}

#[cfg(not(unix))]
fn deelevate_group() -> Result<()> {
    Err(Safeguard::DeelevateGroup.failed("requires a unix host"))
}

#[cfg(not(unix))]
fn deelevate_user() -> Result<()> {
    Err(Safeguard::DeelevateUser.failed("requires a unix host"))
}
