//! Pipeline command handlers
//!
//! Loads definition files, validates them and runs them to completion.

use anyhow::{Context, Result};
use colored::*;
use pipewright_core::{PipelineDefinition, PipelineKind, RunState, RunStatus};
use pipewright_engine::{ComponentRegistry, PipelineRunner};
use std::path::Path;
use tracing::info;

use crate::config::Config;

/// Read and parse a definition file
fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read definition file: {}", path.display()))?;
    PipelineDefinition::from_json(&source)
        .with_context(|| format!("Failed to parse definition file: {}", path.display()))
}

fn runner(config: &Config) -> PipelineRunner {
    PipelineRunner::new(ComponentRegistry::with_builtins(), config.engine.clone())
}

/// Validate a definition file and report every problem found
pub fn validate(path: &Path, config: &Config) -> Result<()> {
    let definition = load_definition(path)?;
    runner(config)
        .validate(&definition)
        .with_context(|| format!("{} is not a valid pipeline", path.display()))?;

    println!("{}", "✓ Pipeline definition is valid".green().bold());
    println!("  Groups:   {}", definition.transform_groups.len());
    println!("  Sequence: {}", definition.sequence.join(" → ").dimmed());
    Ok(())
}

/// Run a definition file and print its final status
pub async fn run(path: &Path, repeat_once: bool, config: &Config) -> Result<()> {
    let mut definition = load_definition(path)?;
    if repeat_once && definition.kind() == PipelineKind::Repeating {
        info!("Running repeating pipeline for a single iteration");
        definition.kind = Some(PipelineKind::Once);
    }

    let status = runner(config)
        .run(definition)
        .await
        .context("Failed to start pipeline")?;

    match status {
        Some(status) => print_status(&status),
        None => anyhow::bail!("Pipeline finished without reporting a status"),
    }
}

fn print_status(status: &RunStatus) -> Result<()> {
    let elapsed = status
        .end_time
        .map(|end| format!("{:.1}s", (end - status.start_time).num_milliseconds() as f64 / 1000.0))
        .unwrap_or_default();

    match status.status {
        RunState::Complete => {
            println!("{}", "✓ Pipeline complete".green().bold());
        }
        RunState::Shutdown => {
            println!("{}", "■ Pipeline shut down".yellow().bold());
        }
        RunState::CompleteWithError => {
            println!("{}", "✗ Pipeline failed".red().bold());
            if let Some(error) = &status.error {
                println!("  Error:   {}", error.red());
            }
        }
        RunState::Starting | RunState::Running => {
            println!("{}", format!("Pipeline ended while {}", status.status).yellow());
        }
    }
    println!("  Run ID:  {}", status.run_id.to_string().cyan());
    if !elapsed.is_empty() {
        println!("  Elapsed: {}", elapsed.dimmed());
    }

    if status.status == RunState::CompleteWithError {
        anyhow::bail!("run {} failed", status.run_id);
    }
    Ok(())
}
