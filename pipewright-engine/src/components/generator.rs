use pipewright_core::Record;
use tracing::{debug, info};

use super::{Interrupted, unless_shutdown};
use crate::channel::control_channel;
use crate::error::{EngineError, Result};
use crate::registry::{Component, StepChannels, StepContext, StepParams};

const DEFAULT_FIELD: &str = "rowNumber";

/// Emits `numRows` records numbered from 1
pub struct RowGenerator {
    num_rows: i64,
    field_name: String,
}

pub(crate) fn decode(params: &StepParams<'_>) -> Result<Box<dyn Component>> {
    params.expect_only(&["numRows", "fieldName"])?;
    let num_rows: i64 = params.parse("numRows")?;
    if num_rows < 0 {
        return Err(EngineError::invalid_config(
            params.step_name(),
            "numRows cannot be negative",
        ));
    }
    Ok(Box::new(RowGenerator {
        num_rows,
        field_name: params
            .optional("fieldName")
            .unwrap_or(DEFAULT_FIELD)
            .to_string(),
    }))
}

impl Component for RowGenerator {
    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let (tx, output) = ctx.record_channel();
        let (control_tx, mut control) = control_channel();
        let stats = ctx.stats();
        let name = ctx.canonical_name().to_string();

        ctx.spawn(async move {
            stats.start();
            let mut sent: i64 = 0;
            for n in 1..=self.num_rows {
                let record = Record::new().with(self.field_name.as_str(), n);
                match unless_shutdown(&mut control, tx.send(record)).await {
                    Interrupted::Shutdown(action) => {
                        info!("{} shutting down after {} row(s)", name, sent);
                        action.acknowledge();
                        break;
                    }
                    Interrupted::Completed(Err(_)) => {
                        debug!("{}: downstream closed", name);
                        break;
                    }
                    Interrupted::Completed(Ok(())) => {
                        sent += 1;
                        stats.add_rows(1);
                    }
                }
            }
            stats.stop();
            debug!("{} generated {} row(s)", name, sent);
            Ok(())
        });

        Ok(StepChannels::OutputWithControl {
            output,
            control: control_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::Step;

    #[test]
    fn test_decode_defaults_field_name() {
        let step = Step::new("RowGenerator").with_data("numRows", "4");
        assert!(decode(&StepParams::new("gen", &step)).is_ok());
    }

    #[test]
    fn test_decode_rejects_bad_rows() {
        for rows in ["-1", "lots", ""] {
            let step = Step::new("RowGenerator").with_data("numRows", rows);
            let err = decode(&StepParams::new("gen", &step)).err().unwrap();
            assert!(matches!(err, EngineError::InvalidStepConfig { .. }), "{}", rows);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_parameters() {
        let step = Step::new("RowGenerator")
            .with_data("numRows", "4")
            .with_data("numRow", "5");
        assert!(decode(&StepParams::new("gen", &step)).is_err());
    }
}
