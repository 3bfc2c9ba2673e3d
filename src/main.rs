//! lakehouse-deploy CLI entrypoint

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lakehouse_deploy::cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Parse and execute CLI
    let cli = Cli::parse();
    cli.execute().await
}
