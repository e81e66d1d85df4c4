//! FIFO work queues shared by a pool of workers.
use std::fmt;
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, Mutex};

use crate::state::QueueFamily;

/// Error returned when pushing onto a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed(pub QueueFamily);

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} queue is closed", self.0)
    }
}

impl std::error::Error for QueueClosed {}

/// Producer side, owned by the scheduler.
///
/// Items are served in push order. Once closed, workers drain what is left
/// and then see `None`.
#[derive(Debug)]
pub struct WorkQueue<T> {
    family: QueueFamily,
    sender: Option<mpsc::UnboundedSender<T>>,
    receiver: QueueReceiver<T>,
}

impl<T> WorkQueue<T> {
    pub fn new(family: QueueFamily) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            family,
            sender: Some(sender),
            receiver: QueueReceiver {
                inner: Arc::new(Mutex::new(receiver)),
            },
        }
    }

    pub const fn family(&self) -> QueueFamily {
        self.family
    }

    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(item).ok())
            .ok_or(QueueClosed(self.family))
    }

    /// Stops accepting work. Already queued items can still be popped.
    pub fn close(&mut self) {
        if self.sender.take().is_some() {
            debug!("Closed {} queue", self.family);
        }
    }

    pub const fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// A handle workers use to pull items.
    pub fn receiver(&self) -> QueueReceiver<T> {
        self.receiver.clone()
    }
}

/// Consumer side, cloned into every worker of a pool.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    inner: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item. Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }

    /// Takes the next item if one is ready without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.try_lock().ok()?.try_recv().ok()
    }
}
