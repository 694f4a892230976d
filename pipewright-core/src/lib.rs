//! Pipewright Core
//!
//! Core types and validation for the Pipewright pipeline engine.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, records, run and step status
//! - Validation: batch reporting of missing mandatory fields
//! - Errors: definition parse and validation errors

pub mod domain;
pub mod error;
pub mod validation;

pub use domain::definition::{
    ConnectionDetails, GroupKind, PipelineDefinition, PipelineKind, RepeatMetadata, Step,
    StepGroup,
};
pub use domain::log::{LogEntry, LogLevel};
pub use domain::record::{Record, Value};
pub use domain::status::{RunState, RunStatus, StepStatus};
pub use error::{DefinitionError, ValidationError};
pub use validation::{Mandatory, validate_definition, validate_step_group};
