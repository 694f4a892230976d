//! Pipewright Engine
//!
//! Runs declarative pipeline definitions.
//!
//! This crate contains:
//! - Component registry: maps step types to typed, decoded components
//! - Step group and transform managers: channel wiring, drains, shutdown
//! - Metadata injection: templated step groups launched per record
//! - Execution driver: group policies, repetition, signals and run status

pub mod channel;
pub mod components;
pub mod config;
pub mod connector;
mod consumers;
pub mod driver;
pub mod error;
pub mod group;
pub mod launch;
pub mod registry;
pub mod reporter;
pub mod stats;
pub mod transform;
pub mod validate;

pub use channel::{
    Action, ControlAction, ControlReceiver, ControlSender, OutputCallback, RecordReceiver,
    RecordSender, control_channel, output_callback, record_channel,
};
pub use config::{EngineConfig, FailureMode};
pub use connector::{Connector, ConnectorFactory, UnsupportedConnectorFactory};
pub use consumers::Delivery;
pub use driver::{LaunchMode, PipelineRunner, RunHandle, sleep_duration_at};
pub use error::{EngineError, Result};
pub use group::StepGroupManager;
pub use registry::{
    ChannelShape, Component, ComponentRegistry, Registration, StepChannels, StepContext,
    StepParams,
};
pub use reporter::{RunCloser, RunRegistry, ShutdownRequest, panic_message};
pub use stats::{StatsHandle, StatsManager, StepWatcher};
pub use transform::{EngineResources, TransformManager};
pub use validate::validate_pipeline;
