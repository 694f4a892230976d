//! Definition validation
//!
//! Walks a parsed definition and collects every missing mandatory field and
//! every dangling sequence reference, so a user can fix all of them in one
//! pass instead of one error at a time.

use crate::domain::definition::{ConnectionDetails, PipelineDefinition, Step, StepGroup};
use crate::error::ValidationError;

/// Types whose mandatory fields can be checked for zero values
pub trait Mandatory {
    /// Pushes a label for each mandatory field that holds its zero value
    ///
    /// `path` is the dotted location of `self` inside the definition and is
    /// used as the prefix of every label.
    fn collect_missing(&self, path: &str, missing: &mut Vec<String>);
}

fn child(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn missing_label(path: &str, field: &str) -> String {
    format!("missing mandatory field '{}'", child(path, field))
}

impl Mandatory for PipelineDefinition {
    fn collect_missing(&self, path: &str, missing: &mut Vec<String>) {
        if self.schema_version == 0 {
            missing.push(missing_label(path, "schemaVersion"));
        }
        if self.kind.is_none() {
            missing.push(missing_label(path, "type"));
        }
        if self.transform_groups.is_empty() {
            missing.push(missing_label(path, "transformGroups"));
        }
        if self.sequence.is_empty() {
            missing.push(missing_label(path, "sequence"));
        }

        let connections = child(path, "connections");
        for (name, connection) in &self.connections {
            connection.collect_missing(&child(&connections, name), missing);
        }

        let groups = child(path, "transformGroups");
        for (name, group) in &self.transform_groups {
            group.collect_missing(&child(&groups, name), missing);
        }
    }
}

impl Mandatory for ConnectionDetails {
    fn collect_missing(&self, path: &str, missing: &mut Vec<String>) {
        if self.connection_type.trim().is_empty() {
            missing.push(missing_label(path, "type"));
        }
        if self.logical_name.trim().is_empty() {
            missing.push(missing_label(path, "logicalName"));
        }
    }
}

impl Mandatory for StepGroup {
    fn collect_missing(&self, path: &str, missing: &mut Vec<String>) {
        if self.kind.is_none() {
            missing.push(missing_label(path, "type"));
        }
        if self.steps.is_empty() {
            missing.push(missing_label(path, "steps"));
        }

        let steps = child(path, "steps");
        for (name, step) in &self.steps {
            step.collect_missing(&child(&steps, name), missing);
        }
    }
}

impl Mandatory for Step {
    fn collect_missing(&self, path: &str, missing: &mut Vec<String>) {
        if self.step_type.trim().is_empty() {
            missing.push(missing_label(path, "type"));
        }
        for (idx, sub_step) in self.sub_steps.iter().enumerate() {
            sub_step.collect_missing(&child(path, &format!("steps[{}]", idx)), missing);
        }
    }
}

/// Checks that every sequence entry names something that exists
fn collect_dangling_references(definition: &PipelineDefinition, problems: &mut Vec<String>) {
    for group_name in &definition.sequence {
        if !definition.transform_groups.contains_key(group_name) {
            problems.push(format!(
                "sequence references undefined step group '{}'",
                group_name
            ));
        }
    }

    for (group_name, group) in &definition.transform_groups {
        for step_name in &group.sequence {
            if !group.steps.contains_key(step_name) {
                problems.push(format!(
                    "transformGroups.{}.sequence references undefined step '{}'",
                    group_name, step_name
                ));
            }
        }
    }
}

/// Validates a parsed pipeline definition
///
/// Returns `Ok(())` if valid, or a single error listing every problem.
pub fn validate_definition(definition: &PipelineDefinition) -> Result<(), ValidationError> {
    let mut problems = Vec::new();
    definition.collect_missing("", &mut problems);
    collect_dangling_references(definition, &mut problems);
    ValidationError::check(problems)
}

/// Validates a single step group, as used for templated groups
pub fn validate_step_group(name: &str, group: &StepGroup) -> Result<(), ValidationError> {
    let mut problems = Vec::new();
    group.collect_missing(name, &mut problems);
    for step_name in &group.sequence {
        if !group.steps.contains_key(step_name) {
            problems.push(format!(
                "{}.sequence references undefined step '{}'",
                name, step_name
            ));
        }
    }
    ValidationError::check(problems)
}
