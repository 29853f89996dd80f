//! The request queue between the frontend and the worker.
//!
//! A bounded FIFO with drop-on-full semantics: admission happens atomically
//! with the enqueue (`try_send` on a bounded channel), so a burst can neither
//! over-admit past the configured length nor drop a request that would have
//! fit. A queue length of `0` means unbounded. Each entry carries a oneshot
//! sender through which the worker delivers exactly one `(report, status)`
//! pair back to the waiting frontend handler.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::endpoint::HttpMethod;
use crate::metrics;

/// One queued request.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Vec<u8>,
    pub query: Vec<(String, String)>,
    /// Where the worker delivers the response.
    pub respond_to: oneshot::Sender<(Value, StatusCode)>,
}

#[derive(Debug)]
pub enum QueueMessage {
    Request(Box<QueueEntry>),
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// The queue is at its configured length; the request is dropped.
    Full,
    /// The worker is gone.
    Closed,
}

/// Entry ids keep the `pid-timestamp` form for log correlation.
pub fn entry_id() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    format!("{}-{}", std::process::id(), micros)
}

#[derive(Clone)]
enum Sender {
    Bounded(mpsc::Sender<QueueMessage>),
    Unbounded(mpsc::UnboundedSender<QueueMessage>),
}

/// Cloneable enqueue side, held by every frontend handler and the startup
/// call-on-start hook.
#[derive(Clone)]
pub struct RequestQueue {
    tx: Sender,
}

/// The single worker's dequeue side.
pub struct QueueReceiver {
    rx: Receiver,
}

enum Receiver {
    Bounded(mpsc::Receiver<QueueMessage>),
    Unbounded(mpsc::UnboundedReceiver<QueueMessage>),
}

impl RequestQueue {
    /// Create a queue with the given length limit; `0` means unbounded.
    pub fn new(limit: usize) -> (RequestQueue, QueueReceiver) {
        if limit == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                RequestQueue {
                    tx: Sender::Unbounded(tx),
                },
                QueueReceiver {
                    rx: Receiver::Unbounded(rx),
                },
            )
        } else {
            let (tx, rx) = mpsc::channel(limit);
            (
                RequestQueue {
                    tx: Sender::Bounded(tx),
                },
                QueueReceiver {
                    rx: Receiver::Bounded(rx),
                },
            )
        }
    }

    /// Enqueue a request. Admission against the length limit is atomic with
    /// the enqueue itself.
    pub fn push(&self, entry: QueueEntry) -> Result<(), PushError> {
        let message = QueueMessage::Request(Box::new(entry));
        let pushed = match &self.tx {
            Sender::Bounded(tx) => tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PushError::Full,
                mpsc::error::TrySendError::Closed(_) => PushError::Closed,
            }),
            Sender::Unbounded(tx) => tx.send(message).map_err(|_| PushError::Closed),
        };
        if pushed.is_ok() {
            metrics::queue_length_inc();
        }
        pushed
    }

    /// Ask the worker to exit once it reaches this message.
    pub fn send_shutdown(&self) {
        match &self.tx {
            // best effort: a full bounded queue drops the sentinel, shutdown
            // is then driven by the cancellation token instead
            Sender::Bounded(tx) => {
                let _ = tx.try_send(QueueMessage::Shutdown);
            }
            Sender::Unbounded(tx) => {
                let _ = tx.send(QueueMessage::Shutdown);
            }
        }
    }
}

impl QueueReceiver {
    /// Receive the next message in FIFO order. `None` once all senders are
    /// gone.
    pub async fn recv(&mut self) -> Option<QueueMessage> {
        let message = match &mut self.rx {
            Receiver::Bounded(rx) => rx.recv().await,
            Receiver::Unbounded(rx) => rx.recv().await,
        };
        if let Some(QueueMessage::Request(_)) = &message {
            metrics::queue_length_dec();
        }
        message
    }
}
