use kennel::{SandboxRequestBuilder, StdioConfig};

use crate::error::{CliResult, child_exit_code};

#[cfg(feature = "python")]
pub mod python;

pub mod delete_all;
pub mod harden;
pub mod run;

/// Launch with the terminal's stdio and exit with the child's code
pub(crate) async fn launch_attached(builder: SandboxRequestBuilder) -> CliResult<()> {
    let request = builder
        .stdin(StdioConfig::Inherit)
        .stdout(StdioConfig::Inherit)
        .stderr(StdioConfig::Inherit)
        .build()?;

    let exit_code = {
        let mut child = kennel::launch(&request).await?;
        tracing::debug!(pid = child.id(), id = request.id(), "kennel: child started");
        let status = child.wait(None).await?;
        child_exit_code(status)
        // child dropped here, keep-alives released
    };

    std::process::exit(exit_code);
}
