//! Syscall allow-list filter for Linux
//!
//! Calls outside the list fail with `EACCES` instead of killing the
//! process, so callers can observe the denial.

use std::collections::BTreeMap;

use seccompiler::{SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use crate::error::{Error, Result};
use crate::hardening::SyscallProfile;

const STEP: &str = "syscall filter";

/// The minimal set: plain I/O on open descriptors, memory, threads and exit
const STRICT: &[i64] = &[
    libc::SYS_openat,
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_writev,
    libc::SYS_fstat,
    libc::SYS_pread64,
    libc::SYS_pwrite64,
    libc::SYS_fsync,
    libc::SYS_fdatasync,
    libc::SYS_close,
    libc::SYS_lseek,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_brk,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_madvise,
    libc::SYS_ppoll,
    libc::SYS_pselect6,
    libc::SYS_clock_nanosleep,
    libc::SYS_nanosleep,
    libc::SYS_clone,
    libc::SYS_getrandom,
    libc::SYS_futex,
    libc::SYS_rt_sigreturn,
    libc::SYS_rt_sigprocmask,
    libc::SYS_sigaltstack,
];

#[cfg(target_arch = "x86_64")]
const STRICT_LEGACY: &[i64] = &[libc::SYS_poll, libc::SYS_select, libc::SYS_fork];
#[cfg(not(target_arch = "x86_64"))]
const STRICT_LEGACY: &[i64] = &[];

/// Adds directory handling, process spawning and signal setup
const DEFAULT_EXTRA: &[i64] = &[
    libc::SYS_newfstatat,
    libc::SYS_statx,
    libc::SYS_getdents64,
    libc::SYS_renameat2,
    libc::SYS_unlinkat,
    libc::SYS_mkdirat,
    libc::SYS_readlinkat,
    libc::SYS_chdir,
    libc::SYS_fchdir,
    libc::SYS_getcwd,
    libc::SYS_faccessat,
    libc::SYS_fcntl,
    libc::SYS_ioctl,
    libc::SYS_execve,
    libc::SYS_uname,
    libc::SYS_pipe2,
    libc::SYS_dup,
    libc::SYS_dup3,
    libc::SYS_wait4,
    libc::SYS_getpid,
    libc::SYS_gettid,
    libc::SYS_set_tid_address,
    libc::SYS_set_robust_list,
    libc::SYS_prlimit64,
    libc::SYS_sched_getaffinity,
    libc::SYS_rt_sigaction,
    libc::SYS_seccomp,
];

#[cfg(target_arch = "x86_64")]
const DEFAULT_LEGACY: &[i64] = &[
    libc::SYS_open,
    libc::SYS_stat,
    libc::SYS_lstat,
    libc::SYS_getdents,
    libc::SYS_rename,
    libc::SYS_unlink,
    libc::SYS_mkdir,
    libc::SYS_rmdir,
    libc::SYS_access,
    libc::SYS_pipe,
    libc::SYS_dup2,
    libc::SYS_readlink,
    libc::SYS_arch_prctl,
];
#[cfg(not(target_arch = "x86_64"))]
const DEFAULT_LEGACY: &[i64] = &[];

/// Syscall numbers a profile allows
pub(crate) fn allowed(profile: SyscallProfile) -> Vec<i64> {
    let mut calls: Vec<i64> = STRICT.iter().chain(STRICT_LEGACY).copied().collect();
    if profile == SyscallProfile::Default {
        calls.extend(DEFAULT_EXTRA.iter().chain(DEFAULT_LEGACY));
    }
    calls.sort_unstable();
    calls.dedup();
    calls
}

fn detect_arch() -> Result<TargetArch> {
    #[cfg(target_arch = "x86_64")]
    return Ok(TargetArch::x86_64);

    #[cfg(target_arch = "aarch64")]
    return Ok(TargetArch::aarch64);

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    return Err(Error::Hardening {
        step: STEP,
        reason: "unsupported architecture".to_string(),
    });
}

/// Compile the allow-list for `profile` to BPF
pub(crate) fn build(profile: SyscallProfile) -> Result<seccompiler::BpfProgram> {
    let failed = |reason: String| Error::Hardening { step: STEP, reason };

    // Empty rule chains match on syscall number only.
    let rules: BTreeMap<i64, Vec<SeccompRule>> = allowed(profile)
        .into_iter()
        .map(|nr| (nr, Vec::new()))
        .collect();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Errno(libc::EACCES as u32),
        SeccompAction::Allow,
        detect_arch()?,
    )
    .map_err(|e| failed(format!("filter error: {e:?}")))?;

    filter
        .try_into()
        .map_err(|e| failed(format!("BPF compilation error: {e:?}")))
}

/// Install the filter on every thread of the process
pub(crate) fn install(profile: SyscallProfile) -> Result<()> {
    let program = build(profile)?;
    seccompiler::apply_filter_all_threads(&program).map_err(|e| Error::Hardening {
        step: STEP,
        reason: e.to_string(),
    })?;
    tracing::debug!(?profile, "hardening: syscall filter installed");
    Ok(())
}
