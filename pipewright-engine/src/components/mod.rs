//! Built-in components

mod combiner;
mod field_mapper;
mod generator;
mod logger;
mod mdi;

pub use combiner::ChannelCombiner;
pub use field_mapper::{FieldMapper, FieldRule};
pub use generator::RowGenerator;
pub use logger::StdOutLogger;
pub use mdi::{MetadataInjection, render_template};

use std::future::Future;

use crate::channel::{ControlAction, ControlReceiver};
use crate::registry::{ChannelShape, ComponentRegistry};

/// Registers every built-in component type
pub fn register_builtins(registry: &mut ComponentRegistry) {
    registry.register(
        "RowGenerator",
        ChannelShape::OutputWithControl,
        generator::decode,
    );
    registry.register(
        "StdOutLogger",
        ChannelShape::OutputWithControl,
        logger::decode,
    );
    registry.register(
        "FieldMapper",
        ChannelShape::OutputWithControl,
        field_mapper::decode,
    );
    registry.register(
        "ChannelCombiner",
        ChannelShape::RequestInput,
        combiner::decode,
    );
    registry.register(
        "MetadataInjection",
        ChannelShape::OutputWithControl,
        mdi::decode,
    );
}

/// Result of racing a worker operation against its control channel
pub(crate) enum Interrupted<T> {
    Completed(T),
    Shutdown(ControlAction),
}

/// Awaits `operation` unless a control action arrives first
///
/// A closed control channel never interrupts.
pub(crate) async fn unless_shutdown<F: Future>(
    control: &mut ControlReceiver,
    operation: F,
) -> Interrupted<F::Output> {
    tokio::select! {
        biased;
        Some(action) = control.recv() => Interrupted::Shutdown(action),
        value = operation => Interrupted::Completed(value),
    }
}
