use crate::transport::{ReceiveEvent, ReceiveHandler, ReceiveSource, SendTransport};
use crate::util::observers::{Observers, SubscriptionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Records every buffer that is sent, and fails sends on request
pub struct TrackingSendTransport {
    sent: Mutex<Vec<Bytes>>,
    fail_next: Mutex<Option<io::ErrorKind>>,
    bytes_sent: AtomicU64,
    notifier: mpsc::UnboundedSender<()>,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
}

impl Default for TrackingSendTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingSendTransport {
    pub fn new() -> TrackingSendTransport {
        let (notifier, notifications) = mpsc::unbounded_channel();
        TrackingSendTransport {
            sent: Default::default(),
            fail_next: Default::default(),
            bytes_sent: Default::default(),
            notifier,
            notifications: tokio::sync::Mutex::new(notifications),
        }
    }

    /// the next send fails with an I/O error of the given kind
    pub fn fail_next_send(&self, kind: io::ErrorKind) {
        *self.fail_next.lock().unwrap() = Some(kind);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// waits until `n` send attempts (successful or not) were made in total since the last call
    pub async fn wait_for_sends(&self, n: usize) {
        let mut notifications = self.notifications.lock().await;
        for _ in 0..n {
            timeout(Duration::from_secs(5), notifications.recv()).await
                .expect("timed out waiting for a send")
                .expect("notification channel closed");
        }
    }
}

#[async_trait]
impl SendTransport for TrackingSendTransport {
    async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        let result = match self.fail_next.lock().unwrap().take() {
            Some(kind) => Err(io::Error::from(kind).into()),
            None => {
                self.sent.lock().unwrap().push(Bytes::copy_from_slice(data));
                self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(data.len())
            }
        };
        let _ = self.notifier.send(());
        result
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// A receive source where test code triggers receive events explicitly
#[derive(Default)]
pub struct ManualReceiveSource {
    handlers: Observers<dyn ReceiveHandler>,
    bytes_received: AtomicU64,
}

impl ManualReceiveSource {
    pub fn fire(&self, remote: SocketAddr, data: &[u8]) {
        self.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

        let event = ReceiveEvent {
            remote,
            data: Bytes::copy_from_slice(data),
        };
        for handler in self.handlers.snapshot() {
            handler.on_receive(&event);
        }
    }

    pub fn num_subscriptions(&self) -> usize {
        self.handlers.len()
    }
}

impl ReceiveSource for ManualReceiveSource {
    fn subscribe(&self, handler: Arc<dyn ReceiveHandler>) -> SubscriptionId {
        self.handlers.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.unsubscribe(id)
    }

    fn total_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}
