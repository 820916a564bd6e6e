use std::process::ExitCode;

pub type CliResult<T> = anyhow::Result<T>;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Process exit code mirroring a finished child
///
/// A child killed by a signal maps to 128 plus the signal number, the way
/// shells report it.
pub fn child_exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_maps_to_failure_code() {
        let code = to_exit_code(Err(anyhow::anyhow!("boom")));
        assert_eq!(code, ExitCode::FAILURE);
        assert_eq!(to_exit_code(Ok(())), ExitCode::SUCCESS);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exit_code() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(child_exit_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
        // Raw wait status 9 is "killed by SIGKILL"
        assert_eq!(child_exit_code(std::process::ExitStatus::from_raw(9)), 137);
    }
}
