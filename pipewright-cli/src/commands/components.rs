//! Component listing

use colored::*;
use pipewright_engine::{ChannelShape, ComponentRegistry};

/// Print every built-in component type with its channel shape
pub fn list() {
    let registry = ComponentRegistry::with_builtins();
    let types = registry.types();

    println!("{}", format!("{} component type(s):", types.len()).bold());
    for (name, shape) in types {
        let shape = match shape {
            ChannelShape::Output => "output",
            ChannelShape::OutputWithControl => "output + control",
            ChannelShape::RequestInput => "request input (blocking)",
        };
        println!("  {:<20} {}", name.cyan(), shape.dimmed());
    }
}
