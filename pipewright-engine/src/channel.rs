//! Channel types connecting steps
//!
//! Records travel over bounded tokio `mpsc` channels. The receiving half is
//! wrapped in a cloneable [`RecordReceiver`] so the same output can be handed
//! to several requesters, and so the engine can tell whether two handles
//! refer to the same channel instance.

use pipewright_core::Record;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Sending half of a record channel
pub type RecordSender = mpsc::Sender<Record>;

/// Callback channel over which requested outputs are delivered
pub type OutputCallback = mpsc::UnboundedSender<RecordReceiver>;

/// Receiving end of an [`OutputCallback`]
pub type OutputCallbackReceiver = mpsc::UnboundedReceiver<RecordReceiver>;

/// Sending half of a step's control channel
pub type ControlSender = mpsc::Sender<ControlAction>;

/// Receiving half of a step's control channel
pub type ControlReceiver = mpsc::Receiver<ControlAction>;

/// Shareable receiving half of a record channel
#[derive(Clone, Debug)]
pub struct RecordReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Record>>>,
}

impl RecordReceiver {
    pub fn new(receiver: mpsc::Receiver<Record>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Receives the next record, or `None` once every sender is gone
    ///
    /// Cancel safe: a record is never lost when this future is dropped.
    pub async fn recv(&self) -> Option<Record> {
        self.inner.lock().await.recv().await
    }

    /// Whether both handles refer to the same underlying channel
    pub fn same_channel(&self, other: &RecordReceiver) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Creates a bounded record channel
pub fn record_channel(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, RecordReceiver::new(rx))
}

/// Creates a control channel
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(1)
}

/// Creates an output callback channel
pub fn output_callback() -> (OutputCallback, OutputCallbackReceiver) {
    mpsc::unbounded_channel()
}

/// Kind of control request sent to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Shutdown,
}

/// A control request with its single reply slot
#[derive(Debug)]
pub struct ControlAction {
    pub action: Action,
    pub response: oneshot::Sender<Result<(), String>>,
}

impl ControlAction {
    /// Creates a shutdown request and the receiver its reply arrives on
    pub fn shutdown() -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (response, reply) = oneshot::channel();
        (
            Self {
                action: Action::Shutdown,
                response,
            },
            reply,
        )
    }

    /// Acknowledges the request
    pub fn acknowledge(self) {
        let _ = self.response.send(Ok(()));
    }

    /// Replies with an error message
    pub fn reject(self, message: impl Into<String>) {
        let _ = self.response.send(Err(message.into()));
    }
}
