//! Pipewright CLI
//!
//! Validates and runs pipeline definition files.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(about = "Declarative ETL pipeline runner", long_about = None)]
struct Cli {
    /// Capacity of every record channel
    #[arg(long, env = "PIPEWRIGHT_CHANNEL_CAPACITY")]
    channel_capacity: Option<usize>,

    /// Seconds a step has to acknowledge shutdown
    #[arg(long, env = "PIPEWRIGHT_SHUTDOWN_TIMEOUT_SECS")]
    shutdown_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipewright_engine=info,pipewright_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.channel_capacity, cli.shutdown_timeout)?;

    handle_command(cli.command, &config).await
}
