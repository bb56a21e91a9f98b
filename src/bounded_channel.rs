// SPDX-License-Identifier: Apache-2.0

//! Bounded queues used between the tail tasks, the sinks and the worklog
//! writer. Dropping every sender closes the queue, which is how a poll
//! signals "no more records" to its sink.

use flume::{Receiver, Sender};
use std::fmt;
use tokio::select;
use tokio_util::sync::CancellationToken;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The receiving side was dropped.
    Disconnected,
    /// The send was abandoned because the shared cancellation token fired.
    Cancelled,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
            SendError::Cancelled => write!(f, "send cancelled"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }

    /// Send, but give up as soon as `cancel` fires. Used where a full queue
    /// must not be able to hold up shutdown.
    pub async fn send_or_cancel(
        &self,
        item: T,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        select! {
            biased;
            res = self.tx.send_async(item) => res.map_err(|_| SendError::Disconnected),
            _ = cancel.cancelled() => Err(SendError::Cancelled),
        }
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Next item, or `None` once all senders are gone and the queue is empty.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}
