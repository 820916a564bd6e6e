use std::process::ExitCode;

use clap::Parser;

mod cli;
mod commands;
mod config;
mod error;

use cli::{Cli, Commands};
use config::{load_config, merge_config};
use error::{CliResult, to_exit_code};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = if cli.verbose {
        "kennel=debug,kennel_cli=debug"
    } else {
        "kennel=warn,kennel_cli=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let result = smol::block_on(async_main(cli));
    to_exit_code(result)
}

async fn async_main(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Run(args) => {
            let file_config = load_config(cli.config.as_deref())?;
            let config = merge_config(file_config, &args.common)?;
            commands::run::execute(args, config).await
        }
        #[cfg(feature = "python")]
        Commands::Python(args) => {
            let file_config = load_config(cli.config.as_deref())?;
            let config = merge_config(file_config, &args.common)?;
            commands::python::execute(args, config).await
        }
        Commands::DeleteAll => commands::delete_all::execute().await,
        Commands::Harden(args) => commands::harden::execute(args),
    }
}
