//! Bounded FIFO of record keys between the monitor and the storer.

use tokio::sync::mpsc;

/// Create a change queue holding at most `capacity` keys.
pub fn change_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx, capacity }, QueueReceiver { rx })
}

#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<String>,
    capacity: usize,
}

impl QueueSender {
    /// Enqueue a key, waiting while the queue is full.
    pub async fn push(&self, key: String) -> anyhow::Result<()> {
        self.tx
            .send(key)
            .await
            .map_err(|_| anyhow::anyhow!("change queue closed"))
    }

    /// Keys currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<String>,
}

impl QueueReceiver {
    /// Next key, or `None` once the queue is closed and drained.
    pub async fn pop(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Refuse further pushes. Keys already queued can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
