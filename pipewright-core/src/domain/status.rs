//! Step and run status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single step inside a step group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Starting,
    Running,
    Done,
}

/// Lifecycle of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Starting,
    Running,
    Complete,
    CompleteWithError,
    Shutdown,
}

impl RunState {
    /// Whether no further transitions follow this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Complete | RunState::CompleteWithError | RunState::Shutdown
        )
    }

    /// Position in the lifecycle; terminal states share the last rank
    fn rank(&self) -> u8 {
        match self {
            RunState::Starting => 0,
            RunState::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_advance_to(&self, next: RunState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Starting => write!(f, "Starting"),
            RunState::Running => write!(f, "Running"),
            RunState::Complete => write!(f, "Complete"),
            RunState::CompleteWithError => write!(f, "CompleteWithError"),
            RunState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A status update emitted by a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub status: RunState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    /// Creates a status stamped now; terminal states get an end time
    pub fn new(run_id: Uuid, status: RunState, start_time: DateTime<Utc>) -> Self {
        let end_time = status.is_terminal().then(Utc::now);
        Self {
            run_id,
            status,
            start_time,
            end_time,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
