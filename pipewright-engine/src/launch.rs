//! Step and step group launching

use pipewright_core::{Step, StepGroup, StepStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::group::StepGroupManager;
use crate::registry::{ChannelShape, Component, StepChannels, StepContext};
use crate::stats::{StatsHandle, StatsManager};
use crate::transform::TransformManager;

/// Launches every step of `group`, then drains unused outputs
///
/// Steps start in declared order, moved back where needed so each one
/// follows the in-group steps it reads from. Refused once the transform is
/// shutting down.
pub fn launch_step_group(
    transform: &Arc<TransformManager>,
    manager: &Arc<StepGroupManager>,
    group: &StepGroup,
) -> Result<()> {
    if transform.is_shutting_down() {
        return Err(EngineError::ShuttingDown);
    }

    let declared = group.launch_order();
    let mut decoded = HashMap::new();
    let mut upstreams = HashMap::new();
    for step_name in &declared {
        let step = group.steps.get(step_name).ok_or_else(|| {
            EngineError::invalid_config(
                step_name.as_str(),
                format!("not defined in step group '{}'", manager.name()),
            )
        })?;
        let (shape, component) = transform.registry().decode(step_name, step)?;
        if shape != ChannelShape::RequestInput {
            upstreams.insert(step_name.clone(), component.upstream_steps());
        }
        decoded.insert(step_name.clone(), (step, shape, component));
    }

    let order = upstream_order(&declared, &upstreams).map_err(|steps| {
        EngineError::UpstreamCycle {
            group: manager.name().to_string(),
            steps,
        }
    })?;
    for step_name in &order {
        let Some((step, shape, component)) = decoded.remove(step_name) else {
            continue;
        };
        start_step(transform, manager, step_name, step, shape, component)?;
    }

    manager.consume_unused_outputs();
    info!(
        "Launched step group '{}' ({} step(s))",
        manager.name(),
        order.len()
    );
    Ok(())
}

/// Orders `declared` so every step comes after the steps it reads from
///
/// Only edges between names in `declared` count. Steps keep their declared
/// position where no edge moves them. On a cycle the steps left unplaced
/// are returned as the error.
pub(crate) fn upstream_order(
    declared: &[String],
    upstreams: &HashMap<String, Vec<String>>,
) -> std::result::Result<Vec<String>, Vec<String>> {
    let mut placed = Vec::with_capacity(declared.len());
    let mut pending: Vec<&String> = declared.iter().collect();
    while !pending.is_empty() {
        let ready = pending.iter().position(|name| {
            upstreams
                .get(*name)
                .is_none_or(|deps| deps.iter().all(|dep| !pending.contains(&dep)))
        });
        match ready {
            Some(index) => placed.push(pending.remove(index).clone()),
            None => return Err(pending.into_iter().cloned().collect()),
        }
    }
    Ok(placed)
}

/// Decodes, wires and starts one step
///
/// Upstream steps read directly must already be running.
pub fn launch_step(
    transform: &Arc<TransformManager>,
    manager: &Arc<StepGroupManager>,
    step_name: &str,
    step: &Step,
) -> Result<()> {
    let (shape, component) = transform.registry().decode(step_name, step)?;
    start_step(transform, manager, step_name, step, shape, component)
}

fn start_step(
    transform: &Arc<TransformManager>,
    manager: &Arc<StepGroupManager>,
    step_name: &str,
    step: &Step,
    shape: ChannelShape,
    component: Box<dyn Component>,
) -> Result<()> {
    let canonical_name =
        TransformManager::canonical_step_name(manager.name(), step_name, &step.step_type);
    let upstreams = component.upstream_steps();

    let inputs = if shape == ChannelShape::RequestInput {
        Vec::new()
    } else {
        upstreams
            .iter()
            .map(|upstream| manager.get_step_output_chan(step_name, upstream))
            .collect::<Result<Vec<_>>>()?
    };

    manager.set_step_status(step_name, StepStatus::Starting);
    let watcher = manager.stats().add_step_watcher(&canonical_name);
    let ctx = StepContext {
        group_name: manager.name().to_string(),
        step_name: step_name.to_string(),
        canonical_name: canonical_name.clone(),
        inputs,
        stats: StatsHandle::new(Some(watcher)),
        group: Arc::clone(manager),
        transform: Arc::clone(transform),
    };

    debug!("Starting step {}", canonical_name);
    let channels = component.start(ctx)?;
    if channels.shape() != shape {
        return Err(EngineError::ShapeMismatch {
            step: canonical_name,
            expected: shape,
            actual: channels.shape(),
        });
    }

    match channels {
        StepChannels::Output(output) => {
            manager.set_step_output_chan(step_name, output);
        }
        StepChannels::OutputWithControl { output, control } => {
            manager.set_step_output_chan(step_name, output);
            manager.set_step_control_chan(step_name, control);
        }
        StepChannels::RequestInput { requests, output } => {
            manager.set_step_output_chan(step_name, output);
            for upstream in &upstreams {
                let delivery = manager.request_chan_input(step_name, upstream, requests.clone());
                debug!(
                    "{} requested output of '{}': {:?}",
                    canonical_name, upstream, delivery
                );
            }
            manager.add_blocking_step(step_name, requests);
        }
    }
    Ok(())
}

/// Launches `group` under a fresh group manager and waits for it to finish
///
/// Used for groups launched by a step, one instance per invocation. Stats
/// are collected by a manager that lives only as long as the group.
pub async fn run_step_group(
    transform: &Arc<TransformManager>,
    name: &str,
    group: &StepGroup,
) -> Result<()> {
    let stats = StatsManager::new();
    let manager = transform.new_step_group_manager(name, group, Arc::clone(&stats), true);
    let launched = launch_step_group(transform, &manager, group);
    if launched.is_err() {
        manager.shutdown().await?;
    }
    manager.wait_for_completion().await;
    stats.stop();
    launched
}
