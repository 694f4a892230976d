//! Global transform manager
//!
//! One instance per run of a pipeline definition. Holds the shared pieces
//! every step group needs: the definition, the component registry, the
//! engine configuration, lazily opened connectors and the registry of step
//! outputs visible across groups. It also owns the list of open step groups
//! so shutdown and completion can be coordinated run-wide.

use pipewright_core::{PipelineDefinition, StepGroup};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::channel::{OutputCallback, RecordReceiver};
use crate::config::EngineConfig;
use crate::connector::{Connector, ConnectorFactory, UnsupportedConnectorFactory};
use crate::consumers::{ConsumerRegistry, Delivery};
use crate::error::{EngineError, Result};
use crate::group::StepGroupManager;
use crate::registry::ComponentRegistry;
use crate::reporter::RunCloser;
use crate::stats::StatsManager;
use crate::validate::referenced_groups;

/// Shared, run-independent engine resources
#[derive(Clone)]
pub struct EngineResources {
    pub registry: Arc<ComponentRegistry>,
    pub config: Arc<EngineConfig>,
    pub connectors: Arc<dyn ConnectorFactory>,
}

impl EngineResources {
    pub fn new(registry: ComponentRegistry, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
            connectors: Arc::new(UnsupportedConnectorFactory),
        }
    }

    pub fn with_connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.connectors = factory;
        self
    }
}

#[derive(Default)]
struct TransformState {
    consumers: ConsumerRegistry,
    direct_consumers: HashMap<String, usize>,
    groups: Vec<Arc<StepGroupManager>>,
}

/// Run-wide coordinator of step groups
pub struct TransformManager {
    run_id: Uuid,
    definition: Arc<PipelineDefinition>,
    resources: EngineResources,
    connectors: tokio::sync::Mutex<HashMap<String, Arc<dyn Connector>>>,
    mdi_targets: BTreeSet<String>,
    state: Mutex<TransformState>,
    cancel: CancellationToken,
    closer: Option<Arc<RunCloser>>,
    failures: Mutex<Vec<String>>,
}

impl TransformManager {
    /// Creates a manager for one run of `definition`
    ///
    /// # Arguments
    /// * `definition` - The validated pipeline definition
    /// * `resources` - Registry, configuration and connector factory
    /// * `closer` - Where step failures are forwarded; `None` only logs them
    /// * `cancel` - Cancelled when the run shuts down
    pub fn new(
        definition: Arc<PipelineDefinition>,
        resources: EngineResources,
        closer: Option<Arc<RunCloser>>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        resources
            .config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let mdi_targets = referenced_groups(&definition, &resources.registry);
        let run_id = Uuid::new_v4();
        debug!(
            "Transform {} created ({} metadata-injection target group(s))",
            run_id,
            mdi_targets.len()
        );

        Ok(Arc::new(Self {
            run_id,
            definition,
            resources,
            connectors: tokio::sync::Mutex::new(HashMap::new()),
            mdi_targets,
            state: Mutex::new(TransformState::default()),
            cancel,
            closer,
            failures: Mutex::new(Vec::new()),
        }))
    }

    fn state(&self) -> MutexGuard<'_, TransformState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn definition(&self) -> &Arc<PipelineDefinition> {
        &self.definition
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.resources.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.resources.config
    }

    /// Token cancelled once shutdown begins
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether `group` is launched by a metadata-injection step
    pub fn is_mdi_target(&self, group: &str) -> bool {
        self.mdi_targets.contains(group)
    }

    /// `group.step(type)`, the name a step is known by in logs and stats
    pub fn canonical_step_name(group: &str, step: &str, step_type: &str) -> String {
        format!("{}.{}({})", group, step, step_type)
    }

    /// Returns the connector for `name`, opening it on first use
    pub async fn connector(&self, name: &str) -> Result<Arc<dyn Connector>> {
        let mut cache = self.connectors.lock().await;
        if let Some(connector) = cache.get(name) {
            return Ok(Arc::clone(connector));
        }

        let details = self
            .definition
            .connections
            .get(name)
            .ok_or_else(|| EngineError::UnknownConnection(name.to_string()))?;
        let connector = self
            .resources
            .connectors
            .open(name, details)
            .await
            .map_err(|source| EngineError::ConnectorOpen {
                name: name.to_string(),
                source,
            })?;

        info!(
            "Opened connection '{}' of type '{}'",
            name, details.connection_type
        );
        cache.insert(name.to_string(), Arc::clone(&connector));
        Ok(connector)
    }

    /// Creates and registers a step group manager
    ///
    /// Untracked groups are left out of [`TransformManager::wait_for_completion`];
    /// they are still shut down with the run.
    pub fn new_step_group_manager(
        self: &Arc<Self>,
        name: &str,
        group: &StepGroup,
        stats: Arc<StatsManager>,
        tracked: bool,
    ) -> Arc<StepGroupManager> {
        let manager = Arc::new(StepGroupManager::new(
            name,
            group,
            Arc::clone(self),
            stats,
            tracked,
        ));
        self.state().groups.push(Arc::clone(&manager));
        manager
    }

    /// Removes a completed group from the open list
    pub(crate) fn deregister_group(&self, group: &StepGroupManager) {
        self.state()
            .groups
            .retain(|g| !std::ptr::eq(Arc::as_ptr(g), group));
    }

    /// Groups that have not completed yet, oldest first
    pub fn open_groups(&self) -> Vec<Arc<StepGroupManager>> {
        self.state().groups.clone()
    }

    /// Records `step`'s output for requesters outside its group
    pub fn publish_step_output(&self, step: &str, output: RecordReceiver) {
        self.state().consumers.publish(step, output);
    }

    /// Looks up an output published by any group, counting the caller as a consumer
    pub fn global_output(&self, step: &str) -> Option<RecordReceiver> {
        let mut state = self.state();
        let output = state.consumers.output(step)?;
        *state.direct_consumers.entry(step.to_string()).or_default() += 1;
        Some(output)
    }

    /// Registers a cross-group request for `target`'s output
    pub fn request_chan_input(
        &self,
        requester: &str,
        target: &str,
        callback: OutputCallback,
    ) -> Delivery {
        self.state().consumers.request(requester, target, callback)
    }

    /// Consumers outside the producing group
    pub fn global_consumer_count(&self, step: &str) -> usize {
        let state = self.state();
        state.consumers.consumer_count(step)
            + state.direct_consumers.get(step).copied().unwrap_or(0)
    }

    pub(crate) fn release_requester(&self, requester: &str) {
        self.state().consumers.release_requester(requester);
    }

    /// Records a step failure and forwards it to the run
    pub fn report_failure(&self, message: String) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.clone());
        match &self.closer {
            Some(closer) => {
                closer.request_shutdown(Some(message));
            }
            None => error!("Run {} failure: {}", self.run_id, message),
        }
    }

    /// Failures reported so far
    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Shuts every open group down, newest first
    ///
    /// Cancellation happens first so nothing new gets launched meanwhile.
    /// Every group is asked even when one fails; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let groups = self.open_groups();
        info!(
            "Shutting down transform {} ({} open group(s))",
            self.run_id,
            groups.len()
        );

        let mut first_error = None;
        for group in groups.iter().rev() {
            if let Err(e) = group.shutdown().await {
                error!("Failed to shut down step group '{}': {}", group.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for every tracked group to finish
    ///
    /// Groups without blocking steps are awaited first, repeatedly, since
    /// finishing groups may have launched new ones. Blocking groups then get
    /// their input gates closed and are awaited last.
    pub async fn wait_for_completion(&self) {
        loop {
            let pending: Vec<_> = self
                .open_groups()
                .into_iter()
                .filter(|g| g.is_tracked() && !g.is_blocking_group())
                .collect();
            if pending.is_empty() {
                break;
            }
            for group in pending {
                group.wait_for_completion().await;
            }
        }

        let blocking: Vec<_> = self
            .open_groups()
            .into_iter()
            .filter(|g| g.is_tracked())
            .collect();
        for group in &blocking {
            group.close_blocking_inputs();
        }
        for group in blocking {
            group.wait_for_completion().await;
        }
        debug!("Transform {} complete", self.run_id);
    }
}
