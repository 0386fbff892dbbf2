//! tsuku - verify installed tools and libraries

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use tsuku_cli::cmd;
use tsuku_cli::{Cli, Commands, EXIT_CANCELLED};
use tsuku_core::verify::RunOutcome;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Usage errors exit 2 from here.
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Verify(args) => cmd::verify::verify(cli.home.as_deref(), args).await,
    };

    match result {
        Ok(RunOutcome::Passed | RunOutcome::PassedWithWarnings) => ExitCode::SUCCESS,
        Ok(RunOutcome::FailedFatal) => ExitCode::FAILURE,
        Ok(RunOutcome::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
