use anyhow::Context;

use crate::error::CliResult;

pub async fn execute() -> CliResult<()> {
    kennel::delete_all_sandboxes()
        .await
        .context("failed to delete sandboxes")?;
    tracing::info!("kennel: all sandboxes deleted");
    Ok(())
}
