//! Execution driver
//!
//! Runs a pipeline definition end to end: validates it, walks the top-level
//! sequence applying each group's execution policy, repeats the whole
//! pipeline when asked to, and turns OS signals, shutdown requests and step
//! failures into a single terminal status.

use chrono::{DateTime, Utc};
use pipewright_core::{GroupKind, PipelineDefinition, PipelineKind, RunState, RunStatus, StepGroup};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connector::ConnectorFactory;
use crate::error::{EngineError, Result};
use crate::launch::launch_step_group;
use crate::registry::ComponentRegistry;
use crate::reporter::{
    RunCloser, RunRegistry, ShutdownRequest, panic_message, spawn_status_consumer,
};
use crate::stats::StatsManager;
use crate::transform::{EngineResources, TransformManager};
use crate::validate::validate_pipeline;

/// How [`PipelineRunner::launch`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Return once the run has finished
    Blocking,
    /// Return as soon as the run has started
    Background,
}

/// Time left to sleep before the next iteration
///
/// `sleep_seconds` minus the whole seconds elapsed since `last_start`,
/// never negative.
pub fn sleep_duration_at(
    last_start: DateTime<Utc>,
    sleep_seconds: u64,
    now: DateTime<Utc>,
) -> Duration {
    let elapsed_secs = u64::try_from((now - last_start).num_seconds()).unwrap_or(0);
    Duration::from_secs(sleep_seconds.saturating_sub(elapsed_secs))
}

fn sleep_duration_since(last_start: DateTime<Utc>, sleep_seconds: u64) -> Duration {
    sleep_duration_at(last_start, sleep_seconds, Utc::now())
}

/// Launches pipeline runs
pub struct PipelineRunner {
    resources: EngineResources,
    runs: Arc<RunRegistry>,
}

impl PipelineRunner {
    pub fn new(registry: ComponentRegistry, config: EngineConfig) -> Self {
        Self {
            resources: EngineResources::new(registry, config),
            runs: RunRegistry::new(),
        }
    }

    pub fn with_connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.resources = self.resources.with_connector_factory(factory);
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.resources.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.resources.config
    }

    /// Status history of every run launched by this runner
    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Checks a definition without running it
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<()> {
        validate_pipeline(definition, &self.resources.registry)
    }

    /// Starts a run of `definition`
    ///
    /// A definition that fails validation is rejected before any status is
    /// emitted.
    pub async fn launch(
        &self,
        definition: PipelineDefinition,
        mode: LaunchMode,
    ) -> Result<RunHandle> {
        self.resources
            .config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        self.validate(&definition)?;

        let run_id = Uuid::new_v4();
        let (closer, statuses, shutdown) =
            RunCloser::new(run_id, self.resources.config.failure_mode);
        let consumer = spawn_status_consumer(Arc::clone(&self.runs), statuses);
        closer.send_status(RunState::Starting, None);
        info!(
            "Starting run {} ({} step group(s))",
            run_id,
            definition.transform_groups.len()
        );

        let execution = RunExecution {
            definition: Arc::new(definition),
            resources: self.resources.clone(),
            closer: Arc::clone(&closer),
            shutdown,
        };
        let task = spawn_supervised("run", Arc::clone(&closer), execution.execute());

        let mut handle = RunHandle {
            run_id,
            closer,
            runs: Arc::clone(&self.runs),
            task: Some(task),
            consumer: Some(consumer),
        };
        if mode == LaunchMode::Blocking {
            handle.join().await;
        }
        Ok(handle)
    }

    /// Runs `definition` to completion and returns its final status
    pub async fn run(&self, definition: PipelineDefinition) -> Result<Option<RunStatus>> {
        let handle = self.launch(definition, LaunchMode::Blocking).await?;
        Ok(handle.wait().await)
    }
}

/// Handle on a launched run
pub struct RunHandle {
    run_id: Uuid,
    closer: Arc<RunCloser>,
    runs: Arc<RunRegistry>,
    task: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Asks the run to stop; returns false once the run has finished
    pub fn request_shutdown(&self) -> bool {
        self.closer.request_shutdown(None)
    }

    /// Stops the run, reporting `message` as its failure
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.closer.request_shutdown(Some(message.into()))
    }

    /// Latest status emitted so far
    pub fn status(&self) -> Option<RunStatus> {
        self.runs.get(self.run_id)
    }

    /// Every status emitted so far, oldest first
    pub fn history(&self) -> Vec<RunStatus> {
        self.runs.history(self.run_id)
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Run {} task ended abnormally: {}", self.run_id, e);
            }
        }
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
    }

    /// Waits for the run to finish and returns its final status
    pub async fn wait(mut self) -> Option<RunStatus> {
        self.join().await;
        self.status()
    }
}

/// Spawns a top-level task whose panic fails the run
fn spawn_supervised<F>(label: &'static str, closer: Arc<RunCloser>, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(task);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            if e.is_panic() {
                let message = panic_message(e.into_panic().as_ref());
                closer.report_failure(format!("{} task panicked: {}", label, message));
                closer.close_all();
            }
        }
    })
}

#[derive(Clone)]
struct ActiveTransform {
    transform: Arc<TransformManager>,
    stats: Arc<StatsManager>,
}

type CurrentTransform = Arc<Mutex<Option<ActiveTransform>>>;

struct RunExecution {
    definition: Arc<PipelineDefinition>,
    resources: EngineResources,
    closer: Arc<RunCloser>,
    shutdown: mpsc::Receiver<ShutdownRequest>,
}

impl RunExecution {
    async fn execute(self) {
        let RunExecution {
            definition,
            resources,
            closer,
            shutdown,
        } = self;

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let current: CurrentTransform = Arc::new(Mutex::new(None));

        let listener = tokio::spawn(listen_for_shutdown(
            shutdown,
            cancel.clone(),
            finished.clone(),
            Arc::clone(&current),
            Arc::clone(&closer),
            resources.config.handle_os_signals,
        ));

        closer.send_status(RunState::Running, None);

        loop {
            let started = Utc::now();
            let stats = StatsManager::new();
            let transform = match TransformManager::new(
                Arc::clone(&definition),
                resources.clone(),
                Some(Arc::clone(&closer)),
                cancel.child_token(),
            ) {
                Ok(transform) => transform,
                Err(e) => {
                    closer.request_shutdown(Some(e.to_string()));
                    cancel.cancelled().await;
                    break;
                }
            };
            set_current(
                &current,
                ActiveTransform {
                    transform: Arc::clone(&transform),
                    stats: Arc::clone(&stats),
                },
            );

            if let Err(e) = run_once(&transform, &definition, &stats).await {
                error!("Run failed: {}", e);
                closer.request_shutdown(Some(e.to_string()));
                cancel.cancelled().await;
                break;
            }
            stats.stop();
            debug!("Iteration stats: {:?}", stats.snapshot());

            // A failed step has already asked the listener to stop the run
            if !transform.failures().is_empty() {
                cancel.cancelled().await;
                break;
            }
            if cancel.is_cancelled() || definition.kind() == PipelineKind::Once {
                break;
            }

            let pause = sleep_duration_since(started, definition.repeat_sleep_seconds());
            info!("Pipeline iteration complete; next one in {:?}", pause);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => break,
            }
        }

        if !cancel.is_cancelled() {
            closer.send_status(RunState::Complete, None);
            info!("Run {} complete", closer.run_id());
        }
        finished.cancel();
        if let Err(e) = listener.await {
            error!("Shutdown listener ended abnormally: {}", e);
        }
        closer.close_all();
    }
}

fn set_current(current: &CurrentTransform, active: ActiveTransform) {
    *current
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(active);
}

/// Walks the top-level sequence once
async fn run_once(
    transform: &Arc<TransformManager>,
    definition: &PipelineDefinition,
    stats: &Arc<StatsManager>,
) -> Result<()> {
    let cancel = transform.cancellation().clone();
    let mut loops = JoinSet::new();

    for group_name in &definition.sequence {
        if cancel.is_cancelled() {
            break;
        }
        if transform.is_mdi_target(group_name) {
            debug!("Skipping '{}'; it is launched by metadata injection", group_name);
            continue;
        }
        let group = definition
            .transform_groups
            .get(group_name)
            .ok_or_else(|| EngineError::UndefinedGroup(group_name.clone()))?;

        match group.kind() {
            GroupKind::Background => {
                let manager =
                    transform.new_step_group_manager(group_name, group, Arc::clone(stats), true);
                launch_step_group(transform, &manager, group)?;
                info!("Step group '{}' running in the background", group_name);
            }
            GroupKind::Sequential => {
                let manager =
                    transform.new_step_group_manager(group_name, group, Arc::clone(stats), true);
                launch_step_group(transform, &manager, group)?;
                if manager.is_blocking_group() {
                    warn!(
                        "Step group '{}' has blocking steps; it completes with the pipeline",
                        group_name
                    );
                    continue;
                }
                tokio::select! {
                    _ = manager.wait_for_completion() => {}
                    _ = cancel.cancelled() => break,
                }
            }
            GroupKind::Repeating => {
                loops.spawn(repeat_group(
                    Arc::clone(transform),
                    group_name.clone(),
                    group.clone(),
                    Arc::clone(stats),
                ));
            }
        }
    }

    tokio::select! {
        _ = transform.wait_for_completion() => {}
        _ = cancel.cancelled() => {}
    }

    if !loops.is_empty() {
        info!("{} repeating step group(s) run until shutdown", loops.len());
    }
    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                let message = panic_message(e.into_panic().as_ref());
                transform.report_failure(format!("repeating group panicked: {}", message));
            }
        }
    }
    Ok(())
}

/// Relaunches `group` until the transform is cancelled
async fn repeat_group(
    transform: Arc<TransformManager>,
    name: String,
    group: StepGroup,
    stats: Arc<StatsManager>,
) {
    let cancel = transform.cancellation().clone();
    let mut iteration: u64 = 0;
    while !cancel.is_cancelled() {
        iteration += 1;
        let started = Utc::now();
        let manager = transform.new_step_group_manager(&name, &group, Arc::clone(&stats), false);

        match launch_step_group(&transform, &manager, &group) {
            Ok(()) => manager.wait_for_completion().await,
            Err(EngineError::ShuttingDown) => break,
            Err(e) => {
                transform.report_failure(format!("step group '{}' failed to launch: {}", name, e));
                break;
            }
        }

        let pause = sleep_duration_since(started, group.repeat_sleep_seconds());
        debug!(
            "Step group '{}' iteration {} done; next in {:?}",
            name, iteration, pause
        );
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => break,
        }
    }
    info!("Repeating step group '{}' stopped after {} iteration(s)", name, iteration);
}

/// Waits for the first shutdown trigger and shuts the run down
async fn listen_for_shutdown(
    mut requests: mpsc::Receiver<ShutdownRequest>,
    cancel: CancellationToken,
    finished: CancellationToken,
    current: CurrentTransform,
    closer: Arc<RunCloser>,
    handle_signals: bool,
) {
    let request = tokio::select! {
        _ = finished.cancelled() => return,
        _ = termination_signal(handle_signals) => {
            info!("Received termination signal");
            ShutdownRequest { error: None }
        }
        received = requests.recv() => match received {
            Some(request) => request,
            None => return,
        },
    };

    cancel.cancel();
    if let Some(message) = &request.error {
        closer.report_failure(message.clone());
    }

    let active = current
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    if let Some(active) = active {
        if let Err(e) = active.transform.shutdown().await {
            closer.report_failure(e.to_string());
        }
        active.stats.stop();
    }

    if request.error.is_none() && !closer.has_failed() {
        closer.send_status(RunState::Shutdown, None);
        info!("Run {} shut down", closer.run_id());
    }
}

/// Resolves on SIGINT or SIGTERM; never resolves when disabled
async fn termination_signal(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
            }
            _ => {
                warn!("Failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sleep_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let at = |ms: i64| start + chrono::Duration::milliseconds(ms);

        assert_eq!(sleep_duration_at(start, 10, at(2_000)), Duration::from_secs(8));
        assert_eq!(sleep_duration_at(start, 10, at(2_500)), Duration::from_secs(8));
        assert_eq!(sleep_duration_at(start, 1, at(3)), Duration::from_secs(1));
        assert_eq!(sleep_duration_at(start, 10, at(10_000)), Duration::ZERO);
        assert_eq!(sleep_duration_at(start, 10, at(0)), Duration::from_secs(10));
        assert_eq!(sleep_duration_at(start, 10, at(15_000)), Duration::ZERO);
        assert_eq!(sleep_duration_at(start, 0, at(1)), Duration::ZERO);
        assert_eq!(sleep_duration_at(start, 5, at(-3_000)), Duration::from_secs(5));
    }
}
