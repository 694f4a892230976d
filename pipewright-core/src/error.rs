//! Error types for definition parsing and validation

use thiserror::Error;

/// Failure to read a pipeline definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The text is not a well-formed definition
    #[error("Failed to parse pipeline definition: {0}")]
    Parse(#[from] serde_json::Error),

    /// The definition parsed but is incomplete or inconsistent
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Every problem found while validating a definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid pipeline definition: {}", .problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    /// Returns `Ok(())` when no problems were collected
    pub fn check(problems: Vec<String>) -> Result<(), ValidationError> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { problems })
        }
    }
}
