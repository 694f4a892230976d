//! Run status reporting
//!
//! A run reports its lifecycle over a status channel and receives shutdown
//! requests over a second channel. Both are owned by a [`RunCloser`] so that
//! whichever task finishes the run closes them exactly once, and so that
//! exactly one failure is ever reported per run.

use chrono::{DateTime, Utc};
use pipewright_core::{LogEntry, RunState, RunStatus};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FailureMode;
use crate::error::EngineError;

const STATUS_CHANNEL_CAPACITY: usize = 32;
const SHUTDOWN_CHANNEL_CAPACITY: usize = 8;

/// Request to stop a run, optionally carrying the error that caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub error: Option<String>,
}

/// Owns the status and shutdown channels of one run
pub struct RunCloser {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    failure_mode: FailureMode,
    status_tx: Mutex<Option<mpsc::Sender<RunStatus>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<ShutdownRequest>>>,
    status_closed: AtomicBool,
    shutdown_closed: AtomicBool,
    failed: AtomicBool,
    last_state: Mutex<Option<RunState>>,
}

impl RunCloser {
    /// Creates a closer with its status and shutdown receivers
    pub fn new(
        run_id: Uuid,
        failure_mode: FailureMode,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<RunStatus>,
        mpsc::Receiver<ShutdownRequest>,
    ) {
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(SHUTDOWN_CHANNEL_CAPACITY);
        let closer = Arc::new(Self {
            run_id,
            started_at: Utc::now(),
            failure_mode,
            status_tx: Mutex::new(Some(status_tx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            status_closed: AtomicBool::new(false),
            shutdown_closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            last_state: Mutex::new(None),
        });
        (closer, status_rx, shutdown_rx)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emits a status update
    ///
    /// Dropped when the status channel is closed, full, or when the update
    /// would move the lifecycle backwards or past a terminal state.
    pub fn send_status(&self, state: RunState, error: Option<String>) -> bool {
        {
            let mut last = self
                .last_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = *last {
                if !previous.can_advance_to(state) {
                    debug!(
                        "Run {}: ignoring status {} after {}",
                        self.run_id, state, previous
                    );
                    return false;
                }
            }
            *last = Some(state);
        }

        let mut status = RunStatus::new(self.run_id, state, self.started_at);
        if let Some(error) = error {
            status = status.with_error(error);
        }

        let guard = self
            .status_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => match tx.try_send(status) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Run {}: dropped status update: {}", self.run_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Asks the run to shut down; `error` marks the run as failed
    pub fn request_shutdown(&self, error: Option<String>) -> bool {
        let guard = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send(ShutdownRequest { error }).is_ok(),
            None => false,
        }
    }

    /// Emits the run's single `CompleteWithError` status
    ///
    /// Later failures are only logged. In [`FailureMode::Fatal`] the process
    /// exits after the status is emitted.
    pub fn report_failure(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.failed.swap(true, Ordering::SeqCst) {
            warn!("Run {}: additional failure: {}", self.run_id, message);
            return false;
        }

        error!("Run {} failed: {}", self.run_id, message);
        self.send_status(RunState::CompleteWithError, Some(message.clone()));

        if self.failure_mode == FailureMode::Fatal {
            self.close_all();
            eprintln!("{}", LogEntry::error(message));
            std::process::exit(1);
        }
        true
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Closes the status channel; true only for the call that closed it
    pub fn close_status(&self) -> bool {
        if self.status_closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.status_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        true
    }

    /// Closes the shutdown channel; true only for the call that closed it
    pub fn close_shutdown(&self) -> bool {
        if self.shutdown_closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        true
    }

    /// Closes both channels; returns how many this call closed
    pub fn close_all(&self) -> usize {
        usize::from(self.close_status()) + usize::from(self.close_shutdown())
    }
}

/// Latest status and full history of every run seen by a runner
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, Vec<RunStatus>>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a status update
    pub fn record(&self, status: RunStatus) {
        info!("Run {} -> {}", status.run_id, status.status);
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(status.run_id)
            .or_default()
            .push(status);
    }

    /// Latest status of a run
    pub fn get(&self, run_id: Uuid) -> Option<RunStatus> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .and_then(|history| history.last().cloned())
    }

    /// Every status a run has emitted, oldest first
    pub fn history(&self, run_id: Uuid) -> Vec<RunStatus> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Latest status of every run
    pub fn list(&self) -> Vec<RunStatus> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter_map(|history| history.last().cloned())
            .collect()
    }
}

/// Feeds a run's status channel into `registry` until it closes
pub fn spawn_status_consumer(
    registry: Arc<RunRegistry>,
    mut statuses: mpsc::Receiver<RunStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(status) = statuses.recv().await {
            registry.record(status);
        }
    })
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(entry) = payload.downcast_ref::<LogEntry>() {
        entry.message.clone()
    } else if let Some(e) = payload.downcast_ref::<EngineError>() {
        e.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
