//! batchpull entry point.

mod cli;
mod config;
mod output;

use std::process::ExitCode;

use batchpull_executor::{OutcomeStatus, ServiceError};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,batchpull=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting batchpull");

    match cli::run(cli).await {
        Ok(status) => exit_code(status),
        Err(e) => {
            match e.downcast_ref::<ServiceError>() {
                Some(service) => eprintln!("error ({}): {service}", service.kind()),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn exit_code(status: OutcomeStatus) -> ExitCode {
    match status {
        OutcomeStatus::Success => ExitCode::SUCCESS,
        OutcomeStatus::Failed => ExitCode::from(1),
        OutcomeStatus::Partial => ExitCode::from(2),
    }
}
