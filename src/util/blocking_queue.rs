use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// A bounded FIFO queue. Adding to a full queue or taking from an empty queue waits for up to a
///  timeout, failing with [TransportError::Timeout] after that.
pub struct BlockingQueue<T> {
    max_size: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl <T> BlockingQueue<T> {
    pub fn new(max_size: usize) -> BlockingQueue<T> {
        assert!(max_size > 0, "a blocking queue needs room for at least one element");

        BlockingQueue {
            max_size,
            items: Mutex::new(VecDeque::with_capacity(max_size)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Appends an item, waiting for room if the queue is full. The item is dropped if there is
    ///  still no room when the timeout expires.
    pub async fn enqueue(&self, item: T, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if items.len() < self.max_size {
                    items.push_back(item);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            trace!("queue is full - waiting");
            if timeout_at(deadline, self.not_full.notified()).await.is_err() {
                return Err(TransportError::Timeout { timeout, operation: "enqueue" }.into());
            }
        }
    }

    /// Takes the oldest item, waiting for one to become available if the queue is empty
    pub async fn dequeue(&self, timeout: Duration) -> anyhow::Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }

            trace!("queue is empty - waiting");
            if timeout_at(deadline, self.not_empty.notified()).await.is_err() {
                return Err(TransportError::Timeout { timeout, operation: "dequeue" }.into());
            }
        }
    }

    /// Appends an item if there is room, handing it back otherwise
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.max_size {
                return Err(item);
            }
            items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.items.lock().unwrap().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_timeout(e: anyhow::Error) {
        assert!(matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Timeout { .. })), "unexpected error {}", e);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo() {
        let queue = BlockingQueue::new(3);
        queue.enqueue(1, Duration::from_secs(1)).await.unwrap();
        queue.enqueue(2, Duration::from_secs(1)).await.unwrap();
        queue.enqueue(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue(Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(queue.dequeue(Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(queue.try_dequeue(), Some(3));
        assert_eq!(queue.try_dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_enqueue() {
        let queue = BlockingQueue::new(2);
        assert_eq!(queue.try_enqueue(1), Ok(()));
        assert_eq!(queue.try_enqueue(2), Ok(()));
        assert_eq!(queue.try_enqueue(3), Err(3));
        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.try_enqueue(3), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_timeout() {
        let queue = BlockingQueue::<u32>::new(1);

        let start = Instant::now();
        assert_timeout(queue.dequeue(Duration::from_millis(500)).await.unwrap_err());
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_timeout() {
        let queue = BlockingQueue::new(1);
        queue.enqueue(1, Duration::from_secs(1)).await.unwrap();

        assert_timeout(queue.enqueue(2, Duration::from_millis(100)).await.unwrap_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(BlockingQueue::new(1));

        let queue_2 = queue.clone();
        let handle = tokio::spawn(async move {
            queue_2.dequeue(Duration::from_secs(10)).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.enqueue(42, Duration::from_secs(1)).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_waits_for_dequeue() {
        let queue = Arc::new(BlockingQueue::new(1));
        queue.enqueue(1, Duration::from_secs(1)).await.unwrap();

        let queue_2 = queue.clone();
        let handle = tokio::spawn(async move {
            queue_2.enqueue(2, Duration::from_secs(10)).await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.dequeue(Duration::from_secs(1)).await.unwrap(), 1);

        handle.await.unwrap().unwrap();
        assert_eq!(queue.try_dequeue(), Some(2));
    }
}
