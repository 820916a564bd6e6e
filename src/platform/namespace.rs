//! Linux namespace backend built on `bwrap`
//!
//! Every granted path is bound at its own location; the sandbox sees the
//! host tree restricted to the granted subset.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{MissingSourceBehavior, SandboxRequest};
use crate::error::{Error, Result};
use crate::keep_alive;
use crate::platform::Child;
use crate::policy::AccessPolicy;

const RESOLVER_CONFIG: &str = "/etc/resolv.conf";

pub(crate) struct Namespace {
    bwrap: PathBuf,
}

impl Namespace {
    pub(crate) fn new(bwrap: PathBuf) -> Self {
        Self { bwrap }
    }

    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let policy = AccessPolicy::from_request(request);
        let keep_alive = keep_alive::ensure_all(policy.ensure_exists())?
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();

        let args = sandbox_args(request, &policy)?;
        let mut cmd = Command::new(&self.bwrap);
        cmd.args(&args).args(request.command());
        request.configure(&mut cmd);

        tracing::info!(id = request.id(), program = request.program(), "sandbox: launching under bwrap");
        let child = cmd
            .spawn()
            .map_err(|e| Error::os_path("spawn", &self.bwrap, e))?;
        Ok(Child::new(child, keep_alive))
    }
}

/// The `bwrap` options that confine a request, without the command
pub(crate) fn sandbox_args(request: &SandboxRequest, policy: &AccessPolicy) -> Result<Vec<OsString>> {
    let mut args: Vec<OsString> = [
        "--die-with-parent",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
        "--tmpfs",
        "/tmp",
        "--dir",
        "/var",
        "--unshare-all",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    let missing = request.options().missing_sources();

    if request.options().allow_networking() {
        tracing::debug!("sandbox: share network");
        args.push("--share-net".into());
        push_bind(&mut args, "--ro-bind-try", Path::new(RESOLVER_CONFIG));
    }

    for path in policy.readable() {
        if let Some(flag) = bind_flag(missing, path, "--ro-bind", "--ro-bind-try")? {
            tracing::debug!(path = %path.display(), "sandbox: allow read");
            push_bind(&mut args, flag, path);
        }
    }

    for path in policy.writable() {
        if let Some(flag) = bind_flag(missing, path, "--bind", "--bind-try")? {
            tracing::debug!(path = %path.display(), "sandbox: allow write");
            push_bind(&mut args, flag, path);
        }
    }

    for path in policy.ensure_exists() {
        tracing::debug!(path = %path.display(), "sandbox: allow write (ensured)");
        push_bind(&mut args, "--bind", path);
    }

    Ok(args)
}

/// Strict binds under `Fail`, best-effort binds under `Skip`
fn bind_flag(
    missing: MissingSourceBehavior,
    path: &Path,
    strict: &'static str,
    lenient: &'static str,
) -> Result<Option<&'static str>> {
    match missing {
        MissingSourceBehavior::Skip => Ok(Some(lenient)),
        MissingSourceBehavior::Fail => Ok(missing.check(path)?.then_some(strict)),
    }
}

fn push_bind(args: &mut Vec<OsString>, flag: &str, path: &Path) {
    args.push(flag.into());
    args.push(path.into());
    args.push(path.into());
}
