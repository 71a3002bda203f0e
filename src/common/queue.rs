//! Bounded message queue for handing inbound jobs to the dispatch task.

use std::sync::Arc;

use crate::{BenchError, Result};

/// Bounded MPMC (multi-producer, multi-consumer) queue.
///
/// Messages are consumed by exactly one receiver. Backed by flume so the
/// producer side can be called from synchronous subscription handlers while
/// the consumer awaits on the runtime.
#[derive(Clone)]
pub struct Queue<T> {
    receiver: Arc<flume::Receiver<T>>,
    sender: Arc<flume::Sender<T>>,
}

impl<T> Queue<T> {
    /// create a new queue
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, rx) = flume::bounded(cap);

        Arc::new(Self {
            receiver: Arc::new(rx),
            sender: Arc::new(tx),
        })
    }

    /// send a message to the queue
    pub fn send(
        &self,
        msg: T,
    ) -> Result<()> {
        self.sender.send(msg).map_err(|e| BenchError::Queue(e.to_string()))
    }

    /// receive a message from the queue asynchronously
    pub async fn next_async(&self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }
}
