//! Component registry
//!
//! Maps the `type` string of a step to a decode function and a channel
//! shape. Decoding turns a step's free-form parameters into a typed
//! [`Component`] up front, so a typo in a definition fails when the graph is
//! built instead of when the step first runs.

use pipewright_core::Step;
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::channel::{ControlSender, OutputCallback, RecordReceiver, RecordSender, record_channel};
use crate::error::{EngineError, Result};
use crate::group::StepGroupManager;
use crate::stats::StatsHandle;
use crate::transform::TransformManager;

/// Channel contract a component fulfils
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelShape {
    /// Output channel only
    Output,
    /// Output channel plus a control channel for cooperative shutdown
    OutputWithControl,
    /// An input-request channel plus an output; used by bridging components
    /// that pull their upstream channels as they become available
    RequestInput,
}

/// Channels returned by a started component
pub enum StepChannels {
    Output(RecordReceiver),
    OutputWithControl {
        output: RecordReceiver,
        control: ControlSender,
    },
    RequestInput {
        requests: OutputCallback,
        output: RecordReceiver,
    },
}

impl StepChannels {
    pub fn shape(&self) -> ChannelShape {
        match self {
            StepChannels::Output(_) => ChannelShape::Output,
            StepChannels::OutputWithControl { .. } => ChannelShape::OutputWithControl,
            StepChannels::RequestInput { .. } => ChannelShape::RequestInput,
        }
    }
}

/// A decoded step, ready to start
///
/// # Example
///
/// ```rust,ignore
/// struct Passthrough { input: String }
///
/// impl Component for Passthrough {
///     fn upstream_steps(&self) -> Vec<String> {
///         vec![self.input.clone()]
///     }
///
///     fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
///         let input = ctx.input(0)?;
///         let (tx, output) = ctx.record_channel();
///         ctx.spawn(async move {
///             while let Some(record) = input.recv().await {
///                 if tx.send(record).await.is_err() {
///                     break;
///                 }
///             }
///             Ok(())
///         });
///         Ok(StepChannels::Output(output))
///     }
/// }
/// ```
pub trait Component: Send + 'static {
    /// Names of the steps whose output this component consumes
    ///
    /// Resolved in order and handed to [`Component::start`] as
    /// `StepContext::input(0..)`, except for [`ChannelShape::RequestInput`]
    /// components, which receive them through their request channel.
    fn upstream_steps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names of step groups this component launches itself
    ///
    /// Groups named here are not launched by the main sequence.
    fn referenced_groups(&self) -> Vec<String> {
        Vec::new()
    }

    /// Starts the component
    ///
    /// Implementations create their output channel, spawn their worker via
    /// [`StepContext::spawn`] and return immediately.
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels>;
}

/// Decode function stored in a registration
pub type DecodeFn = Arc<dyn Fn(&StepParams<'_>) -> Result<Box<dyn Component>> + Send + Sync>;

/// A registered component type
#[derive(Clone)]
pub struct Registration {
    pub shape: ChannelShape,
    decode: DecodeFn,
}

/// Registry of component types
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ComponentRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in components
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::components::register_builtins(&mut registry);
        registry
    }

    /// Registers a component type
    ///
    /// # Panics
    /// Panics if the type is already registered
    pub fn register<F>(&mut self, type_name: &str, shape: ChannelShape, decode: F)
    where
        F: Fn(&StepParams<'_>) -> Result<Box<dyn Component>> + Send + Sync + 'static,
    {
        if self.entries.contains_key(type_name) {
            panic!("Component type '{}' is already registered", type_name);
        }
        self.entries.insert(
            type_name.to_string(),
            Registration {
                shape,
                decode: Arc::new(decode),
            },
        );
    }

    /// Gets a registration by type name
    pub fn get(&self, type_name: &str) -> Option<&Registration> {
        self.entries.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Registered type names with their shapes, sorted by name
    pub fn types(&self) -> Vec<(&str, ChannelShape)> {
        self.entries
            .iter()
            .map(|(name, reg)| (name.as_str(), reg.shape))
            .collect()
    }

    /// Decodes a step into its typed component
    pub fn decode(
        &self,
        step_name: &str,
        step: &Step,
    ) -> Result<(ChannelShape, Box<dyn Component>)> {
        let registration = self
            .entries
            .get(&step.step_type)
            .ok_or_else(|| EngineError::UnknownComponent {
                step: step_name.to_string(),
                type_name: step.step_type.clone(),
            })?;
        let params = StepParams::new(step_name, step);
        let component = (registration.decode)(&params)?;
        Ok((registration.shape, component))
    }
}

/// Typed access to a step's parameters during decoding
pub struct StepParams<'a> {
    step_name: &'a str,
    step: &'a Step,
}

impl<'a> StepParams<'a> {
    pub fn new(step_name: &'a str, step: &'a Step) -> Self {
        Self { step_name, step }
    }

    pub fn step_name(&self) -> &str {
        self.step_name
    }

    pub fn step(&self) -> &Step {
        self.step
    }

    /// Returns a mandatory, non-empty parameter
    pub fn required(&self, key: &str) -> Result<&'a str> {
        match self.step.param(key) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(EngineError::invalid_config(
                self.step_name,
                format!("missing mandatory parameter '{}'", key),
            )),
        }
    }

    /// Returns an optional parameter; blank values count as absent
    pub fn optional(&self, key: &str) -> Option<&'a str> {
        self.step.param(key).filter(|v| !v.trim().is_empty())
    }

    /// Parses a mandatory parameter
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.required(key)?;
        raw.trim().parse::<T>().map_err(|_| {
            EngineError::invalid_config(
                self.step_name,
                format!("parameter '{}' has invalid value '{}'", key, raw),
            )
        })
    }

    /// Rejects parameters outside `allowed`
    pub fn expect_only(&self, allowed: &[&str]) -> Result<()> {
        let unknown: Vec<&str> = self
            .step
            .data
            .keys()
            .map(String::as_str)
            .filter(|key| !allowed.contains(key))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(EngineError::invalid_config(
                self.step_name,
                format!("unknown parameter(s): {}", unknown.join(", ")),
            ))
        }
    }

    /// Splits a comma separated parameter into trimmed, non-empty items
    pub fn list(&self, key: &str) -> Result<Vec<String>> {
        let items: Vec<String> = self
            .required(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if items.is_empty() {
            return Err(EngineError::invalid_config(
                self.step_name,
                format!("parameter '{}' has no entries", key),
            ));
        }
        Ok(items)
    }
}

/// Everything a started component gets from the engine
pub struct StepContext {
    pub(crate) group_name: String,
    pub(crate) step_name: String,
    pub(crate) canonical_name: String,
    pub(crate) inputs: Vec<RecordReceiver>,
    pub(crate) stats: StatsHandle,
    pub(crate) group: Arc<StepGroupManager>,
    pub(crate) transform: Arc<TransformManager>,
}

impl StepContext {
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// `group.step(type)`, used in logs
    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }

    /// The resolved output of the `index`-th upstream step
    pub fn input(&self, index: usize) -> Result<RecordReceiver> {
        self.inputs.get(index).cloned().ok_or_else(|| {
            EngineError::invalid_config(
                &self.step_name,
                format!("no upstream input at position {}", index),
            )
        })
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn transform(&self) -> &Arc<TransformManager> {
        &self.transform
    }

    /// Creates a record channel with the engine's configured capacity
    pub fn record_channel(&self) -> (RecordSender, RecordReceiver) {
        record_channel(self.transform.config().channel_capacity)
    }

    /// Runs the component's worker as a tracked task of this step
    ///
    /// The step counts as running until the future finishes. An error or a
    /// panic is reported as a run failure.
    pub fn spawn<F>(&self, worker: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.group.spawn_step_task(&self.step_name, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Component for Noop {
        fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
            let (_tx, output) = ctx.record_channel();
            Ok(StepChannels::Output(output))
        }
    }

    #[test]
    fn test_component_registration() {
        let mut registry = ComponentRegistry::new();
        registry.register("Noop", ChannelShape::Output, |_| Ok(Box::new(Noop)));

        assert!(registry.contains("Noop"));
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.types(), vec![("Noop", ChannelShape::Output)]);

        let (shape, _) = registry.decode("n", &Step::new("Noop")).unwrap();
        assert_eq!(shape, ChannelShape::Output);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration() {
        let mut registry = ComponentRegistry::new();
        registry.register("Noop", ChannelShape::Output, |_| Ok(Box::new(Noop)));
        registry.register("Noop", ChannelShape::Output, |_| Ok(Box::new(Noop)));
    }

    #[test]
    fn test_decode_unknown_type() {
        let registry = ComponentRegistry::new();
        let err = registry
            .decode("s", &Step::new("Nope"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownComponent { .. }));
        assert!(err.to_string().contains("'Nope'"));
    }

    #[test]
    fn test_step_params() {
        let step = Step::new("X")
            .with_data("numRows", "12")
            .with_data("blank", " ")
            .with_data("names", "a, b,,c");
        let params = StepParams::new("s", &step);

        assert_eq!(params.parse::<u64>("numRows").unwrap(), 12);
        assert!(params.required("blank").is_err());
        assert_eq!(params.optional("blank"), None);
        assert_eq!(params.list("names").unwrap(), vec!["a", "b", "c"]);
        assert!(params.parse::<u64>("names").is_err());
        assert!(params.expect_only(&["numRows", "blank", "names"]).is_ok());

        let err = params.expect_only(&["numRows"]).unwrap_err();
        assert!(err.to_string().contains("blank"));
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = ComponentRegistry::with_builtins();
        for name in [
            "RowGenerator",
            "StdOutLogger",
            "FieldMapper",
            "ChannelCombiner",
            "MetadataInjection",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert_eq!(
            registry.get("ChannelCombiner").unwrap().shape,
            ChannelShape::RequestInput
        );
    }
}
