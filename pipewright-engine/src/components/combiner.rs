use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::channel::output_callback;
use crate::error::Result;
use crate::registry::{Component, StepChannels, StepContext, StepParams};

/// Merges the outputs of several steps into one channel
///
/// Upstream outputs arrive over the request channel, possibly long after the
/// combiner started and possibly more than once per step when a group is
/// relaunched. The combiner forwards from every channel it receives and
/// finishes once its request channel is closed and every input is drained.
pub struct ChannelCombiner {
    inputs: Vec<String>,
}

pub(crate) fn decode(params: &StepParams<'_>) -> Result<Box<dyn Component>> {
    params.expect_only(&["inputStepName"])?;
    Ok(Box::new(ChannelCombiner {
        inputs: params.list("inputStepName")?,
    }))
}

impl Component for ChannelCombiner {
    fn upstream_steps(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn start(self: Box<Self>, ctx: StepContext) -> Result<StepChannels> {
        let (requests, mut incoming) = output_callback();
        let (tx, output) = ctx.record_channel();
        let stats = ctx.stats();
        let name = ctx.canonical_name().to_string();

        ctx.spawn(async move {
            stats.start();
            let mut forwarders: JoinSet<u64> = JoinSet::new();
            let mut accepting = true;
            let mut sources = 0usize;

            loop {
                tokio::select! {
                    received = incoming.recv(), if accepting => match received {
                        Some(input) => {
                            sources += 1;
                            let tx = tx.clone();
                            forwarders.spawn(async move {
                                let mut forwarded = 0;
                                while let Some(record) = input.recv().await {
                                    if tx.send(record).await.is_err() {
                                        break;
                                    }
                                    forwarded += 1;
                                }
                                forwarded
                            });
                        }
                        None => accepting = false,
                    },
                    Some(joined) = forwarders.join_next(), if !forwarders.is_empty() => {
                        match joined {
                            Ok(forwarded) => stats.add_rows(forwarded),
                            Err(e) => warn!("{}: forwarder ended abnormally: {}", name, e),
                        }
                    }
                    else => break,
                }
            }

            stats.stop();
            debug!("{} combined {} input channel(s)", name, sources);
            Ok(())
        });

        Ok(StepChannels::RequestInput { requests, output })
    }
}
