//! Error types for the Pipewright engine

use pipewright_core::ValidationError;
use std::time::Duration;
use thiserror::Error;

use crate::registry::ChannelShape;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building or running a pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition failed mandatory-field or reference validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No component is registered under the step's type
    #[error("Unknown component type '{type_name}' for step '{step}'")]
    UnknownComponent { step: String, type_name: String },

    /// A step's parameters could not be decoded into its typed config
    #[error("Invalid configuration for step '{step}': {message}")]
    InvalidStepConfig { step: String, message: String },

    /// A step names an upstream step that does not exist
    #[error("Step '{step}' references undefined upstream step '{upstream}'")]
    UndefinedUpstream { step: String, upstream: String },

    /// Steps of one group read from each other in a loop
    #[error("Step group '{group}' has an upstream cycle through steps: {}", .steps.join(", "))]
    UpstreamCycle { group: String, steps: Vec<String> },

    /// A step name is declared by more than one launched step group
    #[error("Step '{step}' is declared in more than one step group: {}", .groups.join(", "))]
    DuplicateStep { step: String, groups: Vec<String> },

    /// A step or the driver names a group that does not exist
    #[error("Undefined step group '{0}'")]
    UndefinedGroup(String),

    /// A component returned channels that do not match its registration
    #[error("Step '{step}' returned {actual:?} channels but is registered as {expected:?}")]
    ShapeMismatch {
        step: String,
        expected: ChannelShape,
        actual: ChannelShape,
    },

    /// A step did not acknowledge a shutdown request in time
    #[error("Step '{step}' did not acknowledge shutdown within {timeout:?}")]
    ShutdownTimeout { step: String, timeout: Duration },

    /// No connection with this logical name is defined
    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    /// The connector factory failed to open a connection
    #[error("Failed to open connection '{name}': {source}")]
    ConnectorOpen {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A metadata-injection template could not be rendered or parsed
    #[error("Step group template error: {0}")]
    Template(#[from] serde_json::Error),

    /// The run is shutting down and refuses new work
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// Engine configuration is invalid
    #[error("Invalid engine configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Builds an invalid step configuration error
    pub fn invalid_config(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStepConfig {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether this error denotes a broken definition rather than a runtime fault
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownComponent { .. }
                | Self::InvalidStepConfig { .. }
                | Self::UndefinedUpstream { .. }
                | Self::UpstreamCycle { .. }
                | Self::DuplicateStep { .. }
                | Self::UndefinedGroup(_)
                | Self::UnknownConnection(_)
        )
    }
}
