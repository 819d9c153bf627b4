//! Bounded hand-off between connection tasks and the consumer
//!
//! Closing is a separate signal from data: once closed, waiters wake up,
//! whatever was already queued can still be drained, then `pop` yields `None`.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cadex_core::{Error, Result};

/// Create a queue holding at most `capacity` undelivered items
///
/// # Panics
/// Panics if `capacity` is zero
#[must_use]
pub fn channel<T>(capacity: usize, shutdown: CancellationToken) -> (QueuePusher<T>, DeliveryQueue<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueuePusher {
            tx,
            closed: shutdown.clone(),
        },
        DeliveryQueue { rx, closed: shutdown },
    )
}

/// Producer side, cloned into each connection task
#[derive(Debug)]
pub struct QueuePusher<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for QueuePusher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> QueuePusher<T> {
    /// Enqueue an item, waiting while the queue is full
    ///
    /// # Errors
    /// Returns an error once the queue has been closed
    pub async fn push(&self, item: T) -> Result<()> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(queue_closed()),
            sent = self.tx.send(item) => sent.map_err(|_| queue_closed()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer side
#[derive(Debug)]
pub struct DeliveryQueue<T> {
    rx: mpsc::Receiver<T>,
    closed: CancellationToken,
}

impl<T> DeliveryQueue<T> {
    /// Wait for the next item; `None` once closed and drained
    pub async fn pop(&mut self) -> Option<T> {
        if self.closed.is_cancelled() {
            return self.rx.try_recv().ok();
        }

        tokio::select! {
            biased;
            item = self.rx.recv() => item,
            () = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Stop accepting items and wake every waiter
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Items waiting to be popped
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Token that closes this queue when cancelled
    #[must_use]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.closed.clone()
    }
}

fn queue_closed() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "delivery queue closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let (pusher, mut queue) = channel(4, CancellationToken::new());
        for i in 0..3 {
            pusher.push(i).await.unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await, Some(0));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_unblocks_pop() {
        let (_pusher, mut queue) = channel::<u32>(1, CancellationToken::new());
        let handle = queue.shutdown_handle();

        let waiter = tokio::spawn(async move { queue.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let popped = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_drain_after_close() {
        let (pusher, mut queue) = channel(4, CancellationToken::new());
        pusher.push("a").await.unwrap();
        pusher.push("b").await.unwrap();
        queue.close();

        assert!(pusher.push("c").await.is_err());
        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, Some("b"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_unblocks_full_push() {
        let (pusher, queue) = channel(1, CancellationToken::new());
        pusher.push(1).await.unwrap();

        let blocked = tokio::spawn({
            let pusher = pusher.clone();
            async move { pusher.push(2).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(pusher.is_closed());
    }

    #[tokio::test]
    async fn test_all_pushers_dropped_ends_queue() {
        let (pusher, mut queue) = channel(2, CancellationToken::new());
        pusher.push(7).await.unwrap();
        drop(pusher);
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
    }
}
