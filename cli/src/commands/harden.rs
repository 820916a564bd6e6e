use std::process::Command;

use anyhow::Context;
use kennel::hardening::Hardening;

use crate::cli::{HardenArgs, HardenProfile};
use crate::error::CliResult;

pub fn execute(args: HardenArgs) -> CliResult<()> {
    let (program, rest) = args
        .command
        .split_first()
        .context("no command to run")?;
    // PATH is gone once the environment is cleared
    let program = which::which(program).with_context(|| format!("command not found: {program}"))?;

    let hardening = match args.profile {
        HardenProfile::Default => Hardening::default_set(),
        HardenProfile::Exhaustive => Hardening::exhaustive(),
    };
    tracing::debug!(steps = hardening.steps().len(), "kennel: hardening process");
    hardening.apply().context("failed to harden process")?;

    let mut command = Command::new(&program);
    command.args(rest);
    exec(command)
}

#[cfg(unix)]
fn exec(mut command: Command) -> CliResult<()> {
    use std::os::unix::process::CommandExt;
    let err = command.exec();
    Err(err).context("failed to exec hardened command")
}

#[cfg(not(unix))]
fn exec(mut command: Command) -> CliResult<()> {
    let status = command.status().context("failed to run hardened command")?;
    std::process::exit(crate::error::child_exit_code(status));
}
