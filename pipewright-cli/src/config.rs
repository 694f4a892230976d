//! Configuration module
//!
//! Builds the engine configuration from the environment and CLI overrides.

use anyhow::{Context, Result};
use pipewright_engine::EngineConfig;
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Configuration handed to every run
    pub engine: EngineConfig,
}

impl Config {
    /// Loads engine settings from the environment, then applies overrides
    pub fn load(channel_capacity: Option<usize>, shutdown_timeout: Option<u64>) -> Result<Self> {
        let mut engine = EngineConfig::from_env().context("Failed to read engine configuration")?;
        if let Some(capacity) = channel_capacity {
            engine = engine.with_channel_capacity(capacity);
        }
        if let Some(secs) = shutdown_timeout {
            engine = engine.with_shutdown_timeout(Duration::from_secs(secs));
        }
        engine.validate().context("Invalid engine configuration")?;
        Ok(Self { engine })
    }
}
