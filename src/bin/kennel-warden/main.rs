//! Privileged jail broker, run as `sudo kennel-warden`
//!
//! Reads one request line from stdin. For a launch it becomes the parent of
//! the jailed command, which inherits the rest of stdin plus stdout and
//! stderr, and exits with that command's exit code.

use std::process::ExitCode;

#[cfg(unix)]
fn main() -> ExitCode {
    // Logs share stderr with the jailed command. RUST_LOG from the caller is
    // deliberately not consulted.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new("kennel=warn"))
        .init();

    match broker::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kennel-warden: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    eprintln!("kennel-warden: only supported on unix hosts");
    ExitCode::FAILURE
}

#[cfg(unix)]
mod broker {
    use std::fs::File;
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::{ExitCode, ExitStatus};

    use kennel::warden::{CONFIG_PATH, NullfsMounter, Warden, WardenConfig, WardenRequest, read_request};
    use kennel::{Error, Result};

    pub fn run() -> Result<ExitCode> {
        let user = std::env::var("SUDO_USER")
            .ok()
            .filter(|user| !user.is_empty())
            .ok_or_else(|| Error::InvalidRequest("SUDO_USER is not set, run through sudo".to_string()))?;
        let config = WardenConfig::load(Path::new(CONFIG_PATH))?;

        // SAFETY: fd 0 is open for the whole process; ManuallyDrop keeps it
        // open for the jailed command.
        let stdin = ManuallyDrop::new(unsafe { File::from_raw_fd(0) });
        let request = read_request(&*stdin)?;

        let warden = Warden::new(config, user, NullfsMounter);
        match request {
            WardenRequest::Launch(payload) => {
                let mut child = warden.launch(&payload)?;
                let status = child.wait()?;
                Ok(exit_code(status))
            }
            WardenRequest::DeleteAllSandboxes => {
                warden.delete_all()?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }

    /// The command's exit code, or 128 plus the signal that killed it
    fn exit_code(status: ExitStatus) -> ExitCode {
        let code = status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(1);
        ExitCode::from(u8::try_from(code).unwrap_or(1))
    }
}
