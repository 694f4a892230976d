use tracing::{debug, info};

use super::{Interrupted, unless_shutdown};
use crate::channel::control_channel;
use crate::error::Result;
use crate::registry::{Component, StepChannels, StepContext, StepParams};

/// Logs every record it reads and passes it on unchanged
pub struct StdOutLogger {
    input: String,
}

pub(crate) fn decode(params: &StepParams<'_>) -> Result<Box<dyn Component>> {
    params.expect_only(&["inputStepName"])?;
    Ok(Box::new(StdOutLogger {
        input: params.required("inputStepName")?.to_string(),
    }))
}

impl Component for StdOutLogger {
    fn upstream_steps(&self) -> Vec<String> {
        vec![self.input.clone()]
    }

    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let input = ctx.input(0)?;
        let (tx, output) = ctx.record_channel();
        let (control_tx, mut control) = control_channel();
        let stats = ctx.stats();
        let name = ctx.canonical_name().to_string();

        ctx.spawn(async move {
            stats.start();
            loop {
                let record = match unless_shutdown(&mut control, input.recv()).await {
                    Interrupted::Shutdown(action) => {
                        action.acknowledge();
                        break;
                    }
                    Interrupted::Completed(None) => break,
                    Interrupted::Completed(Some(record)) => record,
                };

                info!(step = %name, "{:?}", record);
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
