//! Deferred output delivery
//!
//! A step may ask for another step's output before that step has been
//! started. Requests are recorded per `(target, requester)` pair together
//! with the channel last delivered to that requester, so each output channel
//! instance reaches each requester at most once: immediately if it already
//! exists, otherwise as soon as it is published.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::channel::{OutputCallback, RecordReceiver};

/// Outcome of an output request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The output existed and was sent right away
    Immediate,
    /// The output will be sent when the target publishes it
    Deferred,
    /// This requester already asked for this target; nothing was sent
    AlreadyRequested,
}

struct ConsumerSlot {
    callback: OutputCallback,
    last_sent: Option<RecordReceiver>,
}

impl ConsumerSlot {
    /// Sends `output` unless it is the channel this slot already received
    fn deliver(&mut self, target: &str, requester: &str, output: &RecordReceiver) -> bool {
        if let Some(last) = &self.last_sent {
            if last.same_channel(output) {
                return false;
            }
        }
        if self.callback.send(output.clone()).is_err() {
            warn!(
                "Requester '{}' is no longer listening for output of '{}'",
                requester, target
            );
            return false;
        }
        self.last_sent = Some(output.clone());
        true
    }
}

/// Published outputs and outstanding requests for them
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    outputs: HashMap<String, RecordReceiver>,
    requests: HashMap<String, BTreeMap<String, ConsumerSlot>>,
}

impl ConsumerRegistry {
    /// Latest published output of `step`
    pub(crate) fn output(&self, step: &str) -> Option<RecordReceiver> {
        self.outputs.get(step).cloned()
    }

    /// Registers `requester`'s interest in `target`'s output
    pub(crate) fn request(
        &mut self,
        requester: &str,
        target: &str,
        callback: OutputCallback,
    ) -> Delivery {
        let slots = self.requests.entry(target.to_string()).or_default();
        if slots.contains_key(requester) {
            debug!(
                "Ignoring repeated request from '{}' for output of '{}'",
                requester, target
            );
            return Delivery::AlreadyRequested;
        }

        let mut slot = ConsumerSlot {
            callback,
            last_sent: None,
        };
        let delivery = match self.outputs.get(target) {
            Some(output) => {
                slot.deliver(target, requester, output);
                Delivery::Immediate
            }
            None => Delivery::Deferred,
        };
        slots.insert(requester.to_string(), slot);
        delivery
    }

    /// Records `step`'s output and serves everyone waiting for it
    ///
    /// Returns the number of requesters the channel was sent to.
    pub(crate) fn publish(&mut self, step: &str, output: RecordReceiver) -> usize {
        let mut delivered = 0;
        if let Some(slots) = self.requests.get_mut(step) {
            for (requester, slot) in slots.iter_mut() {
                if slot.deliver(step, requester, &output) {
                    delivered += 1;
                }
            }
        }
        self.outputs.insert(step.to_string(), output);
        delivered
    }

    /// Number of requesters registered for `step`'s output
    pub(crate) fn consumer_count(&self, step: &str) -> usize {
        self.requests.get(step).map(BTreeMap::len).unwrap_or(0)
    }

    /// Drops every request made by `requester`, closing its callbacks here
    pub(crate) fn release_requester(&mut self, requester: &str) {
        for slots in self.requests.values_mut() {
            slots.remove(requester);
        }
    }
}
