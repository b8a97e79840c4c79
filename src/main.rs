mod analytics;
mod api;
mod catalog;
mod cli;
mod clock;
mod error;
mod logstore;
mod metrics;
mod model;
mod orchestrator;
mod parser;
mod poller;
mod preferences;
mod session;
mod snapshot;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = cli::Cli::parse();
    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            Err(e)
        }
    }
}
