//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod components;
mod pipeline;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check a pipeline definition without running it
    Validate {
        /// Path to the definition JSON file
        file: PathBuf,
    },
    /// Run a pipeline definition
    Run {
        /// Path to the definition JSON file
        file: PathBuf,

        /// Run a repeating pipeline for a single iteration
        #[arg(long)]
        repeat_once: bool,
    },
    /// List the registered component types
    Components,
}

/// Handle a CLI command
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Validate { file } => pipeline::validate(&file, config),
        Commands::Run { file, repeat_once } => pipeline::run(&file, repeat_once, config).await,
        Commands::Components => {
            components::list();
            Ok(())
        }
    }
}
