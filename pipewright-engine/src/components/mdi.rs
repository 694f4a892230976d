//! Metadata injection
//!
//! For every input record, fills the `${...}` placeholders of a step group
//! template with the record's field values, then launches the resulting
//! group and waits for it. The filled-in JSON is also emitted downstream in
//! the `stepGroupJson` field.

use pipewright_core::{Record, StepGroup, validate_step_group};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Interrupted, unless_shutdown};
use crate::channel::{ControlReceiver, RecordReceiver, RecordSender, control_channel};
use crate::error::{EngineError, Result};
use crate::launch::run_step_group;
use crate::registry::{Component, StepChannels, StepContext, StepParams};
use crate::stats::StatsHandle;
use crate::transform::TransformManager;

/// Field of each output record holding the rendered group definition
pub const STEP_GROUP_JSON_FIELD: &str = "stepGroupJson";

/// Launches a step group once per input record
pub struct MetadataInjection {
    input: String,
    target_group: String,
    replacements: Vec<(String, String)>,
    time_layout: Option<String>,
}

pub(crate) fn decode(params: &StepParams<'_>) -> Result<Box<dyn Component>> {
    params.expect_only(&[
        "inputStepName",
        "mdiStepGroup",
        "replacementVariableWithFieldNameCSV",
        "replacementDateTimeFormat",
    ])?;

    let mut replacements = Vec::new();
    for pair in params.list("replacementVariableWithFieldNameCSV")? {
        match pair.split_once(':') {
            Some((variable, field)) if !variable.trim().is_empty() && !field.trim().is_empty() => {
                replacements.push((variable.trim().to_string(), field.trim().to_string()));
            }
            _ => {
                return Err(EngineError::invalid_config(
                    params.step_name(),
                    format!("replacement '{}' is not of the form variable:field", pair),
                ));
            }
        }
    }

    Ok(Box::new(MetadataInjection {
        input: params.required("inputStepName")?.to_string(),
        target_group: params.required("mdiStepGroup")?.to_string(),
        replacements,
        time_layout: params.optional("replacementDateTimeFormat").map(String::from),
    }))
}

/// Substitutes every variable in `template` with its field's value from `record`
///
/// Values are JSON-escaped so the result stays valid JSON. Missing fields
/// substitute an empty string.
pub fn render_template(
    template: &str,
    replacements: &[(String, String)],
    record: &Record,
    time_layout: &str,
) -> String {
    let mut rendered = template.to_string();
    for (variable, field) in replacements {
        let value = match record.get(field) {
            Some(value) => value.render(time_layout),
            None => {
                warn!("Record has no field '{}' for '{}'", field, variable);
                String::new()
            }
        };
        rendered = rendered.replace(variable.as_str(), &json_escape(&value));
    }
    rendered
}

fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

impl Component for MetadataInjection {
    fn upstream_steps(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn referenced_groups(&self) -> Vec<String> {
        vec![self.target_group.clone()]
    }

    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let transform = Arc::clone(ctx.transform());
        let group = transform
            .definition()
            .transform_groups
            .get(&self.target_group)
            .ok_or_else(|| EngineError::UndefinedGroup(self.target_group.clone()))?;
        let template = serde_json::to_string(group)?;
        let time_layout = self
            .time_layout
            .clone()
            .unwrap_or_else(|| transform.config().mdi_time_layout.clone());

        let input = ctx.input(0)?;
        let (tx, output) = ctx.record_channel();
        let (control_tx, control) = control_channel();
        let worker = InjectionWorker {
            transform,
            template,
            time_layout,
            input,
            output: tx,
            control,
            stats: ctx.stats(),
            name: ctx.canonical_name().to_string(),
        };
        ctx.spawn(worker.run(*self));

        Ok(StepChannels::OutputWithControl {
            output,
            control: control_tx,
        })
    }
}

struct InjectionWorker {
    transform: Arc<TransformManager>,
    template: String,
    time_layout: String,
    input: RecordReceiver,
    output: RecordSender,
    control: ControlReceiver,
    stats: StatsHandle,
    name: String,
}

impl InjectionWorker {
    async fn run(mut self, step: MetadataInjection) -> anyhow::Result<()> {
        let cancel = self.transform.cancellation().clone();
        self.stats.start();
        let mut launched = 0u64;
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                received = unless_shutdown(&mut self.control, self.input.recv()) => Some(received),
            };
            let record = match received {
                None => break,
                Some(Interrupted::Shutdown(action)) => {
                    action.acknowledge();
                    break;
                }
                Some(Interrupted::Completed(None)) => break,
                Some(Interrupted::Completed(Some(record))) => record,
            };

            let rendered =
                render_template(&self.template, &step.replacements, &record, &self.time_layout);
            let injected: StepGroup = serde_json::from_str(&rendered)?;
            validate_step_group(&step.target_group, &injected)?;

            debug!("{} launching '{}'", self.name, step.target_group);
            run_step_group(&self.transform, &step.target_group, &injected).await?;
            launched += 1;
            self.stats.add_rows(1);

            let out = Record::new().with(STEP_GROUP_JSON_FIELD, rendered);
            match unless_shutdown(&mut self.control, self.output.send(out)).await {
                Interrupted::Shutdown(action) => {
                    action.acknowledge();
                    break;
                }
                Interrupted::Completed(Err(_)) => break,
                Interrupted::Completed(Ok(())) => {}
            }
        }
        self.stats.stop();
        info!(
            "{} launched '{}' {} time(s)",
            self.name, step.target_group, launched
        );
        Ok(())
    }
}
