//! Per-record field rules
//!
//! A `FieldMapper` step carries its rules as nested steps, applied in order:
//!
//! ```json
//! { "type": "FieldMapper",
//!   "data": { "inputStepName": "gen" },
//!   "steps": [
//!     { "type": "RenameField", "data": { "fromField": "rowNumber", "toField": "id" } },
//!     { "type": "SetField", "data": { "field": "source", "value": "demo" } },
//!     { "type": "DropField", "data": { "field": "scratch" } } ] }
//! ```

use pipewright_core::{Record, Value};
use tracing::debug;

use super::{Interrupted, unless_shutdown};
use crate::channel::control_channel;
use crate::error::{EngineError, Result};
use crate::registry::{Component, StepChannels, StepContext, StepParams};

/// A single field rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    Rename { from: String, to: String },
    Set { field: String, value: String },
    Drop { field: String },
}

impl FieldRule {
    fn decode(params: &StepParams<'_>) -> Result<Self> {
        match params.step().step_type.as_str() {
            "RenameField" => {
                params.expect_only(&["fromField", "toField"])?;
                Ok(FieldRule::Rename {
                    from: params.required("fromField")?.to_string(),
                    to: params.required("toField")?.to_string(),
                })
            }
            "SetField" => {
                params.expect_only(&["field", "value"])?;
                Ok(FieldRule::Set {
                    field: params.required("field")?.to_string(),
                    value: params.step().param("value").unwrap_or_default().to_string(),
                })
            }
            "DropField" => {
                params.expect_only(&["field"])?;
                Ok(FieldRule::Drop {
                    field: params.required("field")?.to_string(),
                })
            }
            other => Err(EngineError::invalid_config(
                params.step_name(),
                format!("unknown field rule '{}'", other),
            )),
        }
    }

    pub fn apply(&self, record: &mut Record) {
        match self {
            FieldRule::Rename { from, to } => {
                if let Some(value) = record.remove(from) {
                    record.insert(to.as_str(), value);
                }
            }
            FieldRule::Set { field, value } => {
                record.insert(field.as_str(), Value::from(value.as_str()));
            }
            FieldRule::Drop { field } => {
                record.remove(field);
            }
        }
    }
}

/// Applies its rules to every record it reads
pub struct FieldMapper {
    input: String,
    rules: Vec<FieldRule>,
}

pub(crate) fn decode(params: &StepParams<'_>) -> Result<Box<dyn Component>> {
    params.expect_only(&["inputStepName"])?;
    let input = params.required("inputStepName")?.to_string();

    let mut rules = Vec::new();
    for (i, sub_step) in params.step().sub_steps.iter().enumerate() {
        let label = format!("{}.steps[{}]", params.step_name(), i);
        rules.push(FieldRule::decode(&StepParams::new(&label, sub_step))?);
    }
    if rules.is_empty() {
        return Err(EngineError::invalid_config(
            params.step_name(),
            "at least one field rule is required",
        ));
    }

    Ok(Box::new(FieldMapper { input, rules }))
}

impl Component for FieldMapper {
    fn upstream_steps(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let input = ctx.input(0)?;
        let (tx, output) = ctx.record_channel();
        let (control_tx, mut control) = control_channel();
        let stats = ctx.stats();
        let name = ctx.canonical_name().to_string();
        let rules = self.rules;

        ctx.spawn(async move {
            stats.start();
            loop {
                let mut record = match unless_shutdown(&mut control, input.recv()).await {
                    Interrupted::Shutdown(action) => {
                        action.acknowledge();
                        break;
                    }
                    Interrupted::Completed(None) => break,
                    Interrupted::Completed(Some(record)) => record,
                };

                for rule in &rules {
                    rule.apply(&mut record);
                }
                stats.add_rows(1);

                match unless_shutdown(&mut control, tx.send(record)).await {
                    Interrupted::Shutdown(action) => {
                        action.acknowledge();
                        break;
                    }
                    Interrupted::Completed(Err(_)) => break,
                    Interrupted::Completed(Ok(())) => {}
                }
            }
            stats.stop();
            debug!("{} finished", name);
            Ok(())
        });

        Ok(StepChannels::OutputWithControl {
            output,
            control: control_tx,
        })
    }
}
