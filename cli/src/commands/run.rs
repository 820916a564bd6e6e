use kennel::SandboxRequest;

use crate::cli::RunArgs;
use crate::config::MergedConfig;
use crate::error::CliResult;

pub async fn execute(args: RunArgs, config: MergedConfig) -> CliResult<()> {
    let command = std::iter::once(args.program).chain(args.args);
    let builder = config.apply(SandboxRequest::builder(command, config.id.clone()));
    super::launch_attached(builder).await
}
