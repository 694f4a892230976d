//! Graph validation
//!
//! Runs after mandatory-field validation. Every step is decoded through the
//! component registry and its references are checked, so a broken
//! definition is rejected before anything starts.

use pipewright_core::{PipelineDefinition, validate_definition};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{EngineError, Result};
use crate::launch::upstream_order;
use crate::registry::{ChannelShape, Component, ComponentRegistry};

/// Groups launched by steps of `definition` rather than by its sequence
///
/// Steps that fail to decode are skipped; [`validate_pipeline`] reports them.
pub fn referenced_groups(
    definition: &PipelineDefinition,
    registry: &ComponentRegistry,
) -> BTreeSet<String> {
    definition
        .transform_groups
        .iter()
        .flat_map(|(_, group)| group.steps.iter())
        .filter_map(|(name, step)| registry.decode(name, step).ok())
        .flat_map(|(_, component)| component.referenced_groups())
        .collect()
}

/// Validates mandatory fields, component types, parameters and references
///
/// All problems are collected and returned together. Steps of one group may
/// be declared in any order, but must not read from each other in a loop,
/// and a step name may be declared by only one launched group. Steps inside groups
/// launched by metadata injection may carry placeholders in their
/// parameters, so only their type is checked here; they are decoded again
/// once the placeholders are filled in.
pub fn validate_pipeline(
    definition: &PipelineDefinition,
    registry: &ComponentRegistry,
) -> Result<()> {
    validate_definition(definition)?;

    let mut decoded: Vec<(String, String, ChannelShape, Box<dyn Component>)> = Vec::new();
    let mut failures: Vec<(String, EngineError)> = Vec::new();
    for (group_name, group) in &definition.transform_groups {
        for (step_name, step) in &group.steps {
            match registry.decode(step_name, step) {
                Ok((shape, component)) => {
                    decoded.push((group_name.clone(), step_name.clone(), shape, component))
                }
                Err(e) => failures.push((group_name.clone(), e)),
            }
        }
    }

    let targets: BTreeSet<String> = decoded
        .iter()
        .flat_map(|(_, _, _, component)| component.referenced_groups())
        .collect();

    let mut problems = Vec::new();
    for (group_name, error) in failures {
        let deferred = targets.contains(&group_name)
            && !matches!(error, EngineError::UnknownComponent { .. });
        if !deferred {
            problems.push(error.to_string());
        }
    }

    for (_, step_name, _, component) in &decoded {
        for upstream in component.upstream_steps() {
            if definition.find_step(&upstream).is_none() {
                problems.push(
                    EngineError::UndefinedUpstream {
                        step: step_name.clone(),
                        upstream,
                    }
                    .to_string(),
                );
            }
        }
        for group in component.referenced_groups() {
            if !definition.transform_groups.contains_key(&group) {
                problems.push(EngineError::UndefinedGroup(group).to_string());
            }
        }
    }

    let mut upstreams: HashMap<&str, HashMap<String, Vec<String>>> = HashMap::new();
    for (group_name, step_name, shape, component) in &decoded {
        if *shape != ChannelShape::RequestInput {
            upstreams
                .entry(group_name.as_str())
                .or_default()
                .insert(step_name.clone(), component.upstream_steps());
        }
    }
    for (group_name, group) in &definition.transform_groups {
        let Some(edges) = upstreams.get(group_name.as_str()) else {
            continue;
        };
        if let Err(steps) = upstream_order(&group.launch_order(), edges) {
            problems.push(
                EngineError::UpstreamCycle {
                    group: group_name.clone(),
                    steps,
                }
                .to_string(),
            );
        }
    }

    let mut declared_by: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (group_name, group) in &definition.transform_groups {
        if targets.contains(group_name) {
            continue;
        }
        for step_name in group.steps.keys() {
            declared_by
                .entry(step_name.as_str())
                .or_default()
                .push(group_name.clone());
        }
    }
    for (step, groups) in declared_by {
        if groups.len() > 1 {
            problems.push(
                EngineError::DuplicateStep {
                    step: step.to_string(),
                    groups,
                }
                .to_string(),
            );
        }
    }

    for group_name in &targets {
        if definition.sequence.contains(group_name) {
            tracing::warn!(
                "Step group '{}' is launched by metadata injection and skipped in the sequence",
                group_name
            );
        }
    }

    pipewright_core::ValidationError::check(problems)?;
    Ok(())
}
