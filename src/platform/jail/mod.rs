//! FreeBSD jail backend
//!
//! The client runs at the caller's privilege and hands a single request
//! line to `kennel-warden` through `sudo`. The warden becomes the parent of
//! the jailed command and exits with its exit code, so the returned
//! [`Child`] tracks the warden process itself.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::{SandboxRequest, StdioConfig};
use crate::error::{Error, Result};
use crate::keep_alive;
use crate::platform::Child;
use crate::policy::AccessPolicy;

pub(crate) mod mount_table;
pub(crate) mod protocol;
pub mod warden;

use protocol::{LaunchPayload, WardenRequest};

pub(crate) struct JailClient {
    elevation: PathBuf,
    warden: PathBuf,
}

impl JailClient {
    pub(crate) fn new(elevation: PathBuf, warden: PathBuf) -> Self {
        Self { elevation, warden }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.elevation);
        cmd.arg(&self.warden);
        cmd
    }

    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let policy = AccessPolicy::from_request(request);
        // Directories are created at the caller's privilege so the user owns them.
        let keep_alive = keep_alive::ensure_all(policy.ensure_exists())?
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();

        let line = protocol::encode(&WardenRequest::Launch(payload(request, &policy)))?;

        let mut cmd = self.command();
        request.configure(&mut cmd);
        cmd.stdin(Stdio::piped());

        tracing::info!(id = request.id(), program = request.program(), "sandbox: handing request to warden");
        let mut inner = cmd
            .spawn()
            .map_err(|e| Error::os_path("spawn", &self.elevation, e))?;
        if let Some(stdin) = inner.stdin.as_mut() {
            stdin
                .write_all(line.as_bytes())
                .and_then(|()| stdin.flush())
                .map_err(|e| Error::os("send request to warden", e))?;
        }
        if request.stdin() != StdioConfig::Piped {
            // The request pipe is the only stdin the warden can forward.
            drop(inner.stdin.take());
        }
        Ok(Child::new(inner, keep_alive))
    }

    pub(crate) fn delete_all(&self) -> Result<()> {
        let line = protocol::encode(&WardenRequest::DeleteAllSandboxes)?;
        let mut inner = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::os_path("spawn", &self.elevation, e))?;
        if let Some(mut stdin) = inner.stdin.take() {
            stdin
                .write_all(line.as_bytes())
                .map_err(|e| Error::os("send request to warden", e))?;
        }
        let output = inner
            .wait_with_output()
            .map_err(|e| Error::os("wait for warden", e))?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!("sandbox: warden removed all jails");
        Ok(())
    }
}

fn payload(request: &SandboxRequest, policy: &AccessPolicy) -> LaunchPayload {
    LaunchPayload {
        cmd: request.command().to_vec(),
        id: request.id().to_string(),
        readable_paths: policy.readable().iter().cloned().collect(),
        writable_paths: policy.all_writable().into_vec(),
        env: request.effective_env(),
        allow_networking: request.options().allow_networking(),
        missing_sources: request.options().missing_sources(),
        cwd: request.current_dir().map(Path::to_path_buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_merges_ensure_exists_into_writable() {
        let request = SandboxRequest::builder(["echo", "hi"], "t1")
            .readable("/usr/lib")
            .writable("/srv")
            .writable_ensure_exists("/tmp/t1")
            .env("LANG", "C")
            .build()
            .unwrap();
        let payload = payload(&request, &AccessPolicy::from_request(&request));
        assert_eq!(payload.readable_paths, vec![PathBuf::from("/usr/lib")]);
        assert_eq!(
            payload.writable_paths,
            vec![PathBuf::from("/srv"), PathBuf::from("/tmp/t1")]
        );
        assert_eq!(payload.env.len(), 1);
    }

    #[test]
    fn test_inherited_env_is_captured() {
        let request = SandboxRequest::builder(["true"], "t2").build().unwrap();
        let payload = payload(&request, &AccessPolicy::from_request(&request));
        assert_eq!(payload.env, request.effective_env());
    }
}
