//! Bounded per-connection delivery queues.
//!
//! Every registered connection owns one FIFO queue that decouples the
//! shared broadcast path from that connection's writer. A full queue fails
//! the push immediately: backpressure is the broadcaster's signal that this
//! recipient is falling behind, never a blocking wait.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;

/// Errors from delivery queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,

    #[error("pop timed out")]
    Timeout,
}

/// Push side of one connection's delivery queue.
///
/// Cloned into every broadcast snapshot; pushing never waits.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<Bytes>,
}

/// Pop side, owned by the connection's writer task.
pub struct QueueReceiver {
    rx: mpsc::Receiver<Bytes>,
}

/// Create a queue pair holding at most `capacity` payloads.
pub fn delivery_queue(capacity: usize) -> (DeliveryQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DeliveryQueue { tx }, QueueReceiver { rx })
}

impl DeliveryQueue {
    /// Push one payload without waiting.
    pub fn push(&self, payload: Bytes) -> Result<(), QueueError> {
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

impl QueueReceiver {
    /// Pop the oldest payload, waiting at most `wait`.
    ///
    /// `Closed` means the push side has been dropped and the queue drained.
    pub async fn pop(&mut self, wait: Duration) -> Result<Bytes, QueueError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Timeout),
        }
    }
}
