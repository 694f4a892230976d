//! Step group manager
//!
//! Owns one step group's wiring: the output and control channel of every
//! step, how many consumers each output has, and the status of every step.
//! It attaches drains to outputs nobody reads, shuts steps down on request
//! and lets callers wait until every step task has finished.

use pipewright_core::{StepGroup, StepStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::channel::{
    ControlAction, ControlSender, OutputCallback, RecordReceiver, control_channel,
};
use crate::consumers::{ConsumerRegistry, Delivery};
use crate::error::{EngineError, Result};
use crate::reporter::panic_message;
use crate::stats::StatsManager;
use crate::transform::TransformManager;

#[derive(Default)]
struct GroupState {
    consumers: ConsumerRegistry,
    /// Consumers that resolved an output directly at launch
    direct_consumers: HashMap<String, usize>,
    /// Control channels in registration order
    controls: Vec<(String, ControlSender)>,
    statuses: BTreeMap<String, StepStatus>,
    /// Running task count per step
    running: HashMap<String, usize>,
    /// Steps whose output already has a drain attached
    drained: HashSet<String>,
    /// Gates of blocking steps, keyed by step name
    blocking: BTreeMap<String, OutputCallback>,
    /// Steps in the order their output was set
    output_order: Vec<String>,
}

/// Manages the steps of one launched step group
pub struct StepGroupManager {
    name: String,
    declared_steps: HashSet<String>,
    tracked: bool,
    transform: Arc<TransformManager>,
    stats: Arc<StatsManager>,
    state: Mutex<GroupState>,
    active: watch::Sender<usize>,
}

impl StepGroupManager {
    /// Creates a manager; use [`TransformManager::new_step_group_manager`]
    /// so the group is registered for global shutdown and waiting
    pub(crate) fn new(
        name: &str,
        group: &StepGroup,
        transform: Arc<TransformManager>,
        stats: Arc<StatsManager>,
        tracked: bool,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            declared_steps: group.steps.keys().cloned().collect(),
            tracked,
            transform,
            stats,
            state: Mutex::new(GroupState::default()),
            active,
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the global completion-wait covers this group
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn stats(&self) -> &Arc<StatsManager> {
        &self.stats
    }

    pub fn set_step_status(&self, step: &str, status: StepStatus) {
        self.state().statuses.insert(step.to_string(), status);
    }

    pub fn step_status(&self, step: &str) -> Option<StepStatus> {
        self.state().statuses.get(step).copied()
    }

    /// Status of every known step, drains included
    pub fn step_statuses(&self) -> BTreeMap<String, StepStatus> {
        self.state().statuses.clone()
    }

    /// Marks one more task of `step` as running
    fn add(&self, step: &str) {
        let mut state = self.state();
        *state.running.entry(step.to_string()).or_default() += 1;
        state.statuses.insert(step.to_string(), StepStatus::Running);
        self.active.send_modify(|n| *n += 1);
    }

    /// Marks one task of `step` as finished
    fn done(&self, step: &str) {
        let mut state = self.state();
        let remaining = match state.running.get_mut(step) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            _ => {
                warn!("Step '{}' finished more tasks than it started", step);
                return;
            }
        };
        if remaining == 0 {
            state.statuses.insert(step.to_string(), StepStatus::Done);
        }
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of step tasks still running
    pub fn active_tasks(&self) -> usize {
        *self.active.borrow()
    }

    /// Runs `worker` as a tracked task of `step`
    ///
    /// Errors and panics are forwarded to the transform manager as run
    /// failures; either way the task counts as done afterwards.
    pub fn spawn_step_task<F>(self: &Arc<Self>, step: &str, worker: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(step);
        let handle = tokio::spawn(worker);
        let group = Arc::clone(self);
        let step = step.to_string();

        tokio::spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(e) if e.is_panic() => Some(panic_message(e.into_panic().as_ref())),
                Err(_) => None,
            };
            if let Some(message) = failure {
                error!("Step '{}.{}' failed: {}", group.name, step, message);
                group
                    .transform
                    .report_failure(format!("step '{}.{}' failed: {}", group.name, step, message));
            }
            group.done(&step);
        });
    }

    /// Stores `step`'s output and serves local and global requesters
    pub fn set_step_output_chan(&self, step: &str, output: RecordReceiver) {
        let delivered = {
            let mut state = self.state();
            if !state.output_order.iter().any(|s| s == step) {
                state.output_order.push(step.to_string());
            }
            state.consumers.publish(step, output.clone())
        };
        if delivered > 0 {
            debug!(
                "Delivered output of '{}.{}' to {} waiting requester(s)",
                self.name, step, delivered
            );
        }
        self.transform.publish_step_output(step, output);
    }

    /// Registers `step`'s control channel
    pub fn set_step_control_chan(&self, step: &str, control: ControlSender) {
        let mut state = self.state();
        match state.controls.iter_mut().find(|(name, _)| name == step) {
            Some(entry) => entry.1 = control,
            None => state.controls.push((step.to_string(), control)),
        }
    }

    /// Resolves an upstream output for a step being launched
    ///
    /// Looks in this group first, then across groups. The target counts as
    /// consumed so no drain is attached to it.
    pub fn get_step_output_chan(&self, requester: &str, target: &str) -> Result<RecordReceiver> {
        {
            let mut state = self.state();
            if let Some(output) = state.consumers.output(target) {
                *state.direct_consumers.entry(target.to_string()).or_default() += 1;
                return Ok(output);
            }
        }
        self.transform
            .global_output(target)
            .ok_or_else(|| EngineError::UndefinedUpstream {
                step: requester.to_string(),
                upstream: target.to_string(),
            })
    }

    /// Asks for `target`'s output to be sent on `callback`
    ///
    /// Targets declared in this group are served locally, others through the
    /// transform manager's global registry.
    pub fn request_chan_input(
        &self,
        requester: &str,
        target: &str,
        callback: OutputCallback,
    ) -> Delivery {
        if self.declared_steps.contains(target) {
            self.state().consumers.request(requester, target, callback)
        } else {
            self.transform.request_chan_input(requester, target, callback)
        }
    }

    /// Registers a step that only ends once `gate` is closed
    pub fn add_blocking_step(&self, step: &str, gate: OutputCallback) {
        self.state().blocking.insert(step.to_string(), gate);
    }

    pub fn is_blocking_group(&self) -> bool {
        !self.state().blocking.is_empty()
    }

    /// Closes the gates of every blocking step
    ///
    /// Drops this group's gate senders and every outstanding request made
    /// by the blocking steps, so their request channels close.
    pub fn close_blocking_inputs(&self) {
        let closed: Vec<String> = {
            let mut state = self.state();
            let names: Vec<String> = std::mem::take(&mut state.blocking).into_keys().collect();
            for name in &names {
                state.consumers.release_requester(name);
            }
            names
        };
        for name in &closed {
            self.transform.release_requester(name);
            debug!("Closed input gate of blocking step '{}.{}'", self.name, name);
        }
    }

    /// Attaches a drain to every output that has no consumer
    pub fn consume_unused_outputs(self: &Arc<Self>) {
        let candidates: Vec<(String, RecordReceiver)> = {
            let state = self.state();
            state
                .output_order
                .iter()
                .filter(|step| !state.drained.contains(*step))
                .filter(|step| {
                    state.direct_consumers.get(*step).copied().unwrap_or(0) == 0
                        && state.consumers.consumer_count(step) == 0
                })
                .filter_map(|step| {
                    state
                        .consumers
                        .output(step)
                        .map(|output| (step.clone(), output))
                })
                .collect()
        };

        for (step, output) in candidates {
            if self.transform.global_consumer_count(&step) > 0 {
                continue;
            }
            self.attach_drain(&step, output);
        }
    }

    fn attach_drain(self: &Arc<Self>, step: &str, output: RecordReceiver) {
        let drain_name = format!("{}.drain", step);
        let (control_tx, mut control) = control_channel();
        {
            let mut state = self.state();
            if !state.drained.insert(step.to_string()) {
                return;
            }
            state
                .statuses
                .insert(drain_name.clone(), StepStatus::Starting);
        }
        self.set_step_control_chan(&drain_name, control_tx);
        debug!("Draining unused output of '{}.{}'", self.name, step);

        let label = format!("{}.{}", self.name, drain_name);
        self.spawn_step_task(&drain_name, async move {
            let mut discarded: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    Some(action) = control.recv() => {
                        action.acknowledge();
                        break;
                    }
                    record = output.recv() => match record {
                        Some(_) => discarded += 1,
                        None => break,
                    },
                }
            }
            debug!("{} discarded {} record(s)", label, discarded);
            Ok(())
        });
    }

    /// Asks every step that is not done to shut down
    ///
    /// Each step must acknowledge within the configured timeout; a step that
    /// does not is a defect and fails the whole shutdown. Blocking steps have
    /// their gates closed afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.transform.config().shutdown_timeout;
        let controls: Vec<(String, ControlSender)> = self.state().controls.clone();

        for (step, control) in controls {
            if self.step_status(&step) == Some(StepStatus::Done) {
                debug!("Step '{}.{}' already done, not sending shutdown", self.name, step);
                continue;
            }

            let (action, reply) = ControlAction::shutdown();
            let exchange = async {
                if control.send(action).await.is_err() {
                    return None;
                }
                reply.await.ok()
            };

            match tokio::time::timeout(timeout, exchange).await {
                Ok(Some(Ok(()))) => {
                    debug!("Step '{}.{}' acknowledged shutdown", self.name, step)
                }
                Ok(Some(Err(message))) => warn!(
                    "Step '{}.{}' reported an error while shutting down: {}",
                    self.name, step, message
                ),
                Ok(None) => debug!(
                    "Step '{}.{}' exited before answering shutdown",
                    self.name, step
                ),
                Err(_) => {
                    error!(
                        "Step '{}.{}' did not acknowledge shutdown within {:?}",
                        self.name, step, timeout
                    );
                    return Err(EngineError::ShutdownTimeout {
                        step: format!("{}.{}", self.name, step),
                        timeout,
                    });
                }
            }
        }

        self.close_blocking_inputs();
        info!("Step group '{}' shut down", self.name);
        Ok(())
    }

    /// Waits until every step task has finished, then deregisters the group
    pub async fn wait_for_completion(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
        self.transform.deregister_group(self);
        debug!("Step group '{}' complete", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{output_callback, record_channel};
    use crate::transform::tests::test_transform;
    use pipewright_core::{GroupKind, Record, Step};
    use std::time::Duration;

    fn group_with(steps: &[&str]) -> StepGroup {
        let mut group = StepGroup::new(GroupKind::Sequential);
        for step in steps {
            group = group.with_step(*step, Step::new("X"));
        }
        group
    }

    #[tokio::test]
    async fn test_unused_output_gets_exactly_one_drain() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["gen"]),
            StatsManager::new(),
            true,
        );

        let (tx, output) = record_channel(2);
        sgm.set_step_output_chan("gen", output);
        sgm.consume_unused_outputs();
        sgm.consume_unused_outputs();

        assert_eq!(sgm.active_tasks(), 1);
        assert_eq!(sgm.step_status("gen.drain"), Some(StepStatus::Running));

        // Far more records than the channel holds: the drain keeps the
        // producer from blocking
        for i in 0..100i64 {
            tokio::time::timeout(Duration::from_secs(1), tx.send(Record::new().with("n", i)))
                .await
                .expect("producer blocked")
                .unwrap();
        }
        drop(tx);

        sgm.wait_for_completion().await;
        assert_eq!(sgm.step_status("gen.drain"), Some(StepStatus::Done));
    }

    #[tokio::test]
    async fn test_consumed_output_is_not_drained() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["gen", "log"]),
            StatsManager::new(),
            true,
        );

        let (_tx, output) = record_channel(2);
        sgm.set_step_output_chan("gen", output);
        sgm.get_step_output_chan("log", "gen").unwrap();
        sgm.consume_unused_outputs();

        assert_eq!(sgm.active_tasks(), 0);
        assert!(sgm.step_status("gen.drain").is_none());
    }

    #[tokio::test]
    async fn test_request_before_and_after_output_exists() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["gen", "a", "b"]),
            StatsManager::new(),
            true,
        );

        let (early_tx, mut early) = output_callback();
        assert_eq!(sgm.request_chan_input("a", "gen", early_tx.clone()), Delivery::Deferred);
        assert_eq!(
            sgm.request_chan_input("a", "gen", early_tx),
            Delivery::AlreadyRequested
        );
        assert!(early.try_recv().is_err());

        let (_tx, output) = record_channel(1);
        sgm.set_step_output_chan("gen", output.clone());
        assert!(early.try_recv().unwrap().same_channel(&output));
        assert!(early.try_recv().is_err());

        let (late_tx, mut late) = output_callback();
        assert_eq!(sgm.request_chan_input("b", "gen", late_tx), Delivery::Immediate);
        assert!(late.try_recv().unwrap().same_channel(&output));
    }

    #[tokio::test]
    async fn test_undefined_upstream() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["log"]),
            StatsManager::new(),
            true,
        );
        let err = sgm.get_step_output_chan("log", "missing").unwrap_err();
        assert!(matches!(err, EngineError::UndefinedUpstream { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_skips_done_steps() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["finished", "live"]),
            StatsManager::new(),
            true,
        );

        // A step whose task has ended but whose control receiver is still
        // reachable: it must not be asked to shut down again
        let (finished_tx, mut finished_rx) = control_channel();
        sgm.set_step_control_chan("finished", finished_tx);
        sgm.spawn_step_task("finished", async { Ok(()) });

        let (live_tx, mut live_rx) = control_channel();
        sgm.set_step_control_chan("live", live_tx);
        sgm.spawn_step_task("live", async move {
            if let Some(action) = live_rx.recv().await {
                action.acknowledge();
            }
            Ok(())
        });

        while sgm.step_status("finished") != Some(StepStatus::Done) {
            tokio::task::yield_now().await;
        }

        sgm.shutdown().await.unwrap();
        sgm.wait_for_completion().await;

        assert!(finished_rx.try_recv().is_err());
        assert_eq!(sgm.step_status("live"), Some(StepStatus::Done));

        // A second shutdown finds nothing left to stop
        sgm.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_timeout_is_an_error() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["stuck"]),
            StatsManager::new(),
            true,
        );

        let (stuck_tx, stuck_rx) = control_channel();
        sgm.set_step_control_chan("stuck", stuck_tx);
        sgm.spawn_step_task("stuck", async move {
            let _hold = stuck_rx;
            std::future::pending::<()>().await;
            Ok(())
        });

        let err = sgm.shutdown().await.unwrap_err();
        assert!(matches!(err, EngineError::ShutdownTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failed_task_is_reported_and_marked_done() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "load",
            &group_with(&["bad"]),
            StatsManager::new(),
            true,
        );
        sgm.spawn_step_task("bad", async { anyhow::bail!("disk full") });
        sgm.wait_for_completion().await;

        assert_eq!(sgm.step_status("bad"), Some(StepStatus::Done));
        let failures = transform.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("disk full"));
    }

    #[tokio::test]
    async fn test_blocking_group_gate() {
        let transform = test_transform();
        let sgm = transform.new_step_group_manager(
            "bridge",
            &group_with(&["combine"]),
            StatsManager::new(),
            true,
        );
        assert!(!sgm.is_blocking_group());

        let (gate, mut requests) = output_callback();
        sgm.request_chan_input("combine", "elsewhere", gate.clone());
        sgm.add_blocking_step("combine", gate);
        assert!(sgm.is_blocking_group());

        sgm.close_blocking_inputs();
        assert!(!sgm.is_blocking_group());
        assert!(requests.recv().await.is_none());
    }
}
