//! Pipeline definition types
//!
//! The declarative graph a pipeline run is built from: top-level step
//! groups, the steps inside them, and the named connections steps refer to.
//! Every field defaults to its zero value when absent so that validation can
//! report all missing mandatory fields in one pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DefinitionError;

/// How often the whole pipeline runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    Once,
    Repeating,
}

/// Execution policy of a step group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Launched and waited on before the next group in the sequence starts
    #[default]
    Sequential,
    /// Launched in a loop that sleeps between iterations
    Repeating,
    /// Launched immediately and left running
    Background,
}

/// Sleep settings for repeating pipelines and groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatMetadata {
    pub sleep_seconds: u64,
}

/// A named database or storage connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionDetails {
    #[serde(rename = "type")]
    pub connection_type: String,
    pub logical_name: String,
    pub data: BTreeMap<String, String>,
}

impl ConnectionDetails {
    pub fn new(connection_type: impl Into<String>, logical_name: impl Into<String>) -> Self {
        Self {
            connection_type: connection_type.into(),
            logical_name: logical_name.into(),
            data: BTreeMap::new(),
        }
    }
}

/// One declared unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Component registry key
    #[serde(rename = "type")]
    pub step_type: String,
    /// Free-form parameters, decoded per component type
    pub data: BTreeMap<String, String>,
    /// Nested steps for components with per-record rules
    #[serde(rename = "steps", skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<Step>,
}

impl Step {
    /// Creates a step of the given type with no parameters
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            ..Default::default()
        }
    }

    /// Adds a parameter
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Adds a nested sub-step
    pub fn with_sub_step(mut self, step: Step) -> Self {
        self.sub_steps.push(step);
        self
    }

    /// Returns a parameter value if present
    pub fn param(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

/// An ordered set of steps sharing one execution policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepGroup {
    #[serde(rename = "type")]
    pub kind: Option<GroupKind>,
    pub repeat_metadata: Option<RepeatMetadata>,
    pub steps: BTreeMap<String, Step>,
    pub sequence: Vec<String>,
}

impl StepGroup {
    /// Creates an empty group of the given kind
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Adds a step and appends it to the launch sequence
    pub fn with_step(mut self, name: impl Into<String>, step: Step) -> Self {
        let name = name.into();
        self.sequence.push(name.clone());
        self.steps.insert(name, step);
        self
    }

    /// Sets the sleep between iterations of a repeating group
    pub fn with_repeat_sleep(mut self, sleep_seconds: u64) -> Self {
        self.repeat_metadata = Some(RepeatMetadata { sleep_seconds });
        self
    }

    /// Effective group kind (sequential when unset)
    pub fn kind(&self) -> GroupKind {
        self.kind.unwrap_or_default()
    }

    pub fn repeat_sleep_seconds(&self) -> u64 {
        self.repeat_metadata
            .as_ref()
            .map(|r| r.sleep_seconds)
            .unwrap_or(0)
    }

    /// Step names in launch order
    ///
    /// The declared sequence wins; a group without one launches its steps in
    /// name order.
    pub fn launch_order(&self) -> Vec<String> {
        if self.sequence.is_empty() {
            self.steps.keys().cloned().collect()
        } else {
            self.sequence.clone()
        }
    }
}

/// Full pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineDefinition {
    pub schema_version: u32,
    pub description: String,
    pub connections: BTreeMap<String, ConnectionDetails>,
    #[serde(rename = "type")]
    pub kind: Option<PipelineKind>,
    pub repeat_metadata: Option<RepeatMetadata>,
    pub transform_groups: BTreeMap<String, StepGroup>,
    pub sequence: Vec<String>,
}

impl PipelineDefinition {
    /// Parses a definition from its JSON form
    pub fn from_json(source: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Serializes the definition back to JSON
    pub fn to_json(&self) -> Result<String, DefinitionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Creates a schema version 1 definition of the given kind
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            schema_version: 1,
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Adds a group and appends it to the top-level sequence
    pub fn with_group(mut self, name: impl Into<String>, group: StepGroup) -> Self {
        let name = name.into();
        self.sequence.push(name.clone());
        self.transform_groups.insert(name, group);
        self
    }

    /// Adds a group without putting it in the top-level sequence
    pub fn with_detached_group(mut self, name: impl Into<String>, group: StepGroup) -> Self {
        self.transform_groups.insert(name.into(), group);
        self
    }

    pub fn with_repeat_sleep(mut self, sleep_seconds: u64) -> Self {
        self.repeat_metadata = Some(RepeatMetadata { sleep_seconds });
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>, details: ConnectionDetails) -> Self {
        self.connections.insert(name.into(), details);
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind.unwrap_or_default()
    }

    pub fn repeat_sleep_seconds(&self) -> u64 {
        self.repeat_metadata
            .as_ref()
            .map(|r| r.sleep_seconds)
            .unwrap_or(0)
    }

    /// Looks up a step by name across every group
    pub fn find_step(&self, step_name: &str) -> Option<(&str, &Step)> {
        self.transform_groups.iter().find_map(|(group_name, group)| {
            group
                .steps
                .get(step_name)
                .map(|step| (group_name.as_str(), step))
        })
    }
}
