use crate::batch_message::BatchMessage;
use crate::config::PooledReceiverConfig;
use crate::fiber::{Fiber, FiberWorker};
use crate::transport::{ReceiveEvent, ReceiveHandler, ReceiveSource};
use crate::util::observers::{Observers, SubscriptionId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

struct PooledReceiverShared {
    handlers: Observers<dyn ReceiveHandler>,
    message_count: AtomicU64,
    package_count: AtomicU64,
}

impl PooledReceiverShared {
    fn deliver(&self, event: &ReceiveEvent) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        for handler in self.handlers.snapshot() {
            handler.on_receive(event);
        }
    }
}

struct ReceiveWorker {
    shared: Arc<PooledReceiverShared>,
    batched: bool,
}

#[async_trait]
impl FiberWorker<ReceiveEvent> for ReceiveWorker {
    async fn process_pass(&mut self, items: Vec<ReceiveEvent>) {
        for event in items {
            if !self.batched {
                self.shared.package_count.fetch_add(1, Ordering::Relaxed);
                self.shared.deliver(&event);
                continue;
            }

            let batch = match BatchMessage::from_binary(event.data) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("dropping malformed package from {:?}: {}", event.remote, e);
                    continue;
                }
            };

            trace!("unpacking batch of {} messages from {:?}", batch.message_count(), event.remote);
            self.shared.package_count.fetch_add(1, Ordering::Relaxed);
            for data in batch.into_messages() {
                self.shared.deliver(&ReceiveEvent {
                    remote: event.remote,
                    data,
                });
            }
        }
    }
}

/// The handler a [PooledReceiver] registers with its underlying transport: it only hands the
///  received buffer over to the pooled receiver's worker, returning control to the transport's
///  I/O task immediately.
struct EnqueueingHandler {
    fiber: Arc<Fiber<ReceiveEvent>>,
}

impl ReceiveHandler for EnqueueingHandler {
    fn on_receive(&self, event: &ReceiveEvent) {
        // `Bytes` is immutable, so sharing the buffer is as good as copying it
        if !self.fiber.enqueue(event.clone()) {
            trace!("receiver is disposed - dropping package from {:?}", event.remote);
        }
    }
}

/// Moves processing of received messages off the underlying transport's I/O task onto a worker
///  task ("fiber") that is dedicated to this receiver, preserving the order in which the
///  transport received them.
///
/// A batched receiver treats every received buffer as a batch frame (as sent by a batched
///  [crate::pooled_sender::PooledSender]) and delivers the frame's messages individually.
///  Malformed frames are logged and dropped as a whole.
///
/// The pooled receiver is itself a [ReceiveSource], so application code can subscribe to it
///  the same way it subscribes to a raw transport.
pub struct PooledReceiver {
    source: Arc<dyn ReceiveSource>,
    source_subscription: Mutex<Option<SubscriptionId>>,
    shared: Arc<PooledReceiverShared>,
    fiber: Arc<Fiber<ReceiveEvent>>,
}

impl PooledReceiver {
    /// Must be called in the context of a tokio runtime
    pub fn new(source: Arc<dyn ReceiveSource>, config: PooledReceiverConfig) -> anyhow::Result<PooledReceiver> {
        config.validate()?;

        let shared = Arc::new(PooledReceiverShared {
            handlers: Observers::new(),
            message_count: AtomicU64::new(0),
            package_count: AtomicU64::new(0),
        });

        let worker = ReceiveWorker {
            shared: shared.clone(),
            batched: config.batched,
        };
        let fiber_name = if config.batched { "batched-receiver" } else { "pooled-receiver" };
        let fiber = Arc::new(Fiber::spawn(fiber_name, worker, config.max_packages_per_pass));

        let source_subscription = source.subscribe(Arc::new(EnqueueingHandler { fiber: fiber.clone() }));

        Ok(PooledReceiver {
            source,
            source_subscription: Mutex::new(Some(source_subscription)),
            shared,
            fiber,
        })
    }

    /// The number of messages delivered to subscribers
    pub fn message_count(&self) -> u64 {
        self.shared.message_count.load(Ordering::Relaxed)
    }

    /// The number of buffers received from the underlying transport and processed successfully
    pub fn package_count(&self) -> u64 {
        self.shared.package_count.load(Ordering::Relaxed)
    }

    pub fn reset_statistics(&self) {
        self.shared.message_count.store(0, Ordering::Relaxed);
        self.shared.package_count.store(0, Ordering::Relaxed);
    }

    fn unsubscribe_from_source(&self) {
        if let Some(id) = self.source_subscription.lock().unwrap().take() {
            debug!("unsubscribing pooled receiver from its transport");
            self.source.unsubscribe(id);
        }
    }

    /// Stops receiving, delivers everything that was already received, and shuts down the worker
    pub async fn close(&self) {
        self.unsubscribe_from_source();
        self.fiber.close_and_wait().await;
    }

    /// Stops receiving and shuts down the worker without waiting for it
    pub fn dispose(&self) {
        self.unsubscribe_from_source();
        self.fiber.close();
    }
}

impl Drop for PooledReceiver {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ReceiveSource for PooledReceiver {
    fn subscribe(&self, handler: Arc<dyn ReceiveHandler>) -> SubscriptionId {
        self.shared.handlers.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.handlers.unsubscribe(id)
    }

    fn total_bytes_received(&self) -> u64 {
        self.source.total_bytes_received()
    }
}
