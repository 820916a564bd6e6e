use anyhow::Context;

use crate::cli::PythonArgs;
use crate::config::MergedConfig;
use crate::error::CliResult;

pub async fn execute(args: PythonArgs, config: MergedConfig) -> CliResult<()> {
    let interpreter = args.python;
    let id = config.id.clone();
    let user_args = args.args;
    // Discovery runs the interpreter and ldd, keep it off the executor
    let builder = smol::unblock(move || {
        kennel::python::python_request(&interpreter, user_args, id)
            .with_context(|| format!("failed to prepare {}", interpreter.display()))
    })
    .await?;

    super::launch_attached(config.apply(builder)).await
}
