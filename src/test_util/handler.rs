use crate::transport::{ReceiveEvent, ReceiveHandler};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};

/// Collects received events so test code can await them
pub struct CollectingReceiveHandler {
    sender: mpsc::UnboundedSender<ReceiveEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<ReceiveEvent>>,
}

impl CollectingReceiveHandler {
    pub fn new() -> Arc<CollectingReceiveHandler> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(CollectingReceiveHandler {
            sender,
            receiver: Mutex::new(receiver),
        })
    }

    pub async fn next(&self) -> ReceiveEvent {
        timeout(Duration::from_secs(5), self.receiver.lock().await.recv()).await
            .expect("timed out waiting for a received message")
            .expect("channel closed")
    }

    pub async fn next_n(&self, n: usize) -> Vec<ReceiveEvent> {
        let mut result = Vec::with_capacity(n);
        for _ in 0..n {
            result.push(self.next().await);
        }
        result
    }

    /// returns `true` if no event arrives within the given time
    pub async fn is_quiet_for(&self, duration: Duration) -> bool {
        timeout(duration, self.receiver.lock().await.recv()).await.is_err()
    }
}

impl ReceiveHandler for CollectingReceiveHandler {
    fn on_receive(&self, event: &ReceiveEvent) {
        let _ = self.sender.send(event.clone());
    }
}
