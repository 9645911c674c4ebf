//! Bounded frame queue between a reader loop and a writer loop
//!
//! Enqueueing into a full queue suspends the producer until the consumer
//! frees a slot. Frames are never dropped by the queue itself.

use super::TunnelError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Create a queue holding at most `capacity` frames (at least one)
pub fn bounded(capacity: usize) -> (FrameTx, FrameRx) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameTx { inner: tx }, FrameRx { inner: rx })
}

/// Producer side
#[derive(Debug, Clone)]
pub struct FrameTx {
    inner: mpsc::Sender<Bytes>,
}

impl FrameTx {
    /// Enqueue a frame, waiting while the queue is full
    pub async fn enqueue(&self, frame: Bytes) -> Result<(), TunnelError> {
        self.inner
            .send(frame)
            .await
            .map_err(|_| TunnelError::QueueClosed)
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.inner.capacity()
    }

    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer side
#[derive(Debug)]
pub struct FrameRx {
    inner: mpsc::Receiver<Bytes>,
}

impl FrameRx {
    /// Wait for the next frame; `None` once every producer is gone and the
    /// queue is drained
    pub async fn dequeue(&mut self) -> Option<Bytes> {
        self.inner.recv().await
    }

    /// Refuse further frames; already queued frames can still be dequeued
    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Frames currently queued
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
