use crate::batch_message::BatchMessage;
use crate::config::PooledSenderConfig;
use crate::error::TransportError;
use crate::fiber::{Fiber, FiberWorker};
use crate::transport::SendTransport;
use crate::util::int_conv::Widen;
use crate::util::observers::{Observers, SubscriptionId};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

/// A failed send on the underlying transport, together with the messages that were not sent
#[derive(Debug)]
pub struct SendError {
    pub error: anyhow::Error,
    pub payload: Vec<Bytes>,
}

#[cfg_attr(test, automock)]
pub trait SendErrorHandler: Send + Sync + 'static {
    fn on_send_error(&self, error: &SendError);
}

struct PooledSenderShared {
    /// `None` after the sender was disposed, turning all sends into no-ops
    transport: RwLock<Option<Arc<dyn SendTransport>>>,
    send_error_handlers: Observers<dyn SendErrorHandler>,
    message_count: AtomicU64,
    package_count: AtomicU64,
}

impl PooledSenderShared {
    fn transport(&self) -> Option<Arc<dyn SendTransport>> {
        self.transport.read().unwrap().clone()
    }

    fn on_sent(&self, num_messages: usize) {
        self.message_count.fetch_add(num_messages.widen(), Ordering::Relaxed);
        self.package_count.fetch_add(1, Ordering::Relaxed);
    }

    fn on_send_error(&self, error: anyhow::Error, payload: Vec<Bytes>) {
        let handlers = self.send_error_handlers.snapshot();
        if handlers.is_empty() {
            warn!("error sending {} message(s), dropping them: {:#}", payload.len(), error);
            return;
        }

        debug!("error sending {} message(s): {:#}", payload.len(), error);
        let send_error = SendError { error, payload };
        for handler in handlers {
            handler.on_send_error(&send_error);
        }
    }

    async fn send_single(&self, message: Bytes) {
        let Some(transport) = self.transport() else {
            trace!("sender is disposed - dropping message");
            return;
        };

        match transport.send(&message).await {
            Ok(_) => self.on_sent(1),
            Err(e) => self.on_send_error(e, vec![message]),
        }
    }

    async fn flush(&self, batch: &mut BatchMessage) {
        let Some(transport) = self.transport() else {
            trace!("sender is disposed - dropping batch");
            batch.clear();
            return;
        };

        trace!("flushing batch of {} messages, {} bytes", batch.message_count(), batch.size());
        match transport.send_vectored(&batch.to_binary()).await {
            Ok(_) => self.on_sent(batch.message_count()),
            Err(e) => self.on_send_error(e, batch.messages().to_vec()),
        }
        batch.clear();
    }
}

struct SendWorker {
    shared: Arc<PooledSenderShared>,
    /// `Some` for batched senders
    batch: Option<BatchMessage>,
    package_size: usize,
}

#[async_trait]
impl FiberWorker<Bytes> for SendWorker {
    async fn process_pass(&mut self, items: Vec<Bytes>) {
        match &mut self.batch {
            None => {
                for message in items {
                    self.shared.send_single(message).await;
                }
            }
            Some(batch) => {
                for message in items {
                    // a message that does not fit next to the batched ones goes into the next batch
                    if message.len() <= batch.max_message_len() && !batch.fits(&message) {
                        self.shared.flush(batch).await;
                    }
                    if let Err(message) = batch.add_message(message) {
                        self.shared.on_send_error(TransportError::InvalidOperation("message exceeds the maximum batch frame size").into(), vec![message]);
                        continue;
                    }
                    if batch.size() >= self.package_size {
                        self.shared.flush(batch).await;
                    }
                }
                // batches are not held back waiting for more data
                if !batch.is_empty() {
                    self.shared.flush(batch).await;
                }
            }
        }
    }
}

/// A sender that decouples application code from the underlying transport: sending a message
///  only puts it into a queue, and a worker task ("fiber") that is dedicated to this sender
///  sends queued messages one at a time and in the order they were queued.
///
/// A batched sender collects the messages that are waiting in the queue into batch frames of up
///  to the configured package size, trading a little latency for far fewer writes. The receiving
///  side must then use a batched [crate::pooled_receiver::PooledReceiver].
///
/// Send failures are never reported to the code calling `send` - they are passed to registered
///  [SendErrorHandler]s (or logged if there are none), and the sender continues with the next
///  message.
pub struct PooledSender {
    shared: Arc<PooledSenderShared>,
    fiber: Fiber<Bytes>,
}

impl PooledSender {
    /// Must be called in the context of a tokio runtime
    pub fn new(transport: Arc<dyn SendTransport>, config: PooledSenderConfig) -> anyhow::Result<PooledSender> {
        config.validate()?;

        let shared = Arc::new(PooledSenderShared {
            transport: RwLock::new(Some(transport)),
            send_error_handlers: Observers::new(),
            message_count: AtomicU64::new(0),
            package_count: AtomicU64::new(0),
        });

        let worker = SendWorker {
            shared: shared.clone(),
            batch: config.batched.then(BatchMessage::new),
            package_size: config.package_size,
        };
        let fiber_name = if config.batched { "batched-sender" } else { "pooled-sender" };

        Ok(PooledSender {
            shared,
            fiber: Fiber::spawn(fiber_name, worker, config.max_messages_per_pass),
        })
    }

    /// Queues a message for sending and returns immediately
    pub fn send(&self, message: Bytes) {
        if !self.fiber.enqueue(message) {
            debug!("sender is disposed - dropping message");
        }
    }

    /// Queues `len` bytes of `buf` starting at `offset`, without copying them
    pub fn send_range(&self, buf: &Bytes, offset: usize, len: usize) -> anyhow::Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > buf.len()) {
            return Err(TransportError::InvalidOperation("send range exceeds the buffer").into());
        }
        self.send(buf.slice(offset..offset + len));
        Ok(())
    }

    /// Queues every buffer as a message of its own
    pub fn send_ranges(&self, messages: impl IntoIterator<Item = Bytes>) {
        for message in messages {
            self.send(message);
        }
    }

    pub fn subscribe_send_errors(&self, handler: Arc<dyn SendErrorHandler>) -> SubscriptionId {
        self.shared.send_error_handlers.subscribe(handler)
    }

    pub fn unsubscribe_send_errors(&self, id: SubscriptionId) -> bool {
        self.shared.send_error_handlers.unsubscribe(id)
    }

    /// The number of messages that were successfully handed to the underlying transport
    pub fn message_count(&self) -> u64 {
        self.shared.message_count.load(Ordering::Relaxed)
    }

    /// The number of sends on the underlying transport. This is the same as the message count
    ///  for an unbatched sender.
    pub fn package_count(&self) -> u64 {
        self.shared.package_count.load(Ordering::Relaxed)
    }

    pub fn reset_statistics(&self) {
        self.shared.message_count.store(0, Ordering::Relaxed);
        self.shared.package_count.store(0, Ordering::Relaxed);
    }

    /// Sends everything that is queued, then shuts down the worker
    pub async fn close(&self) {
        self.fiber.close_and_wait().await;
        self.shared.transport.write().unwrap().take();
    }

    /// Shuts down immediately: queued messages are discarded, and the underlying transport is
    ///  not touched any more, even by a send that is racing with this call.
    pub fn dispose(&self) {
        if self.shared.transport.write().unwrap().take().is_some() {
            debug!("disposing pooled sender");
        }
        self.fiber.close();
    }
}

impl Drop for PooledSender {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl SendTransport for PooledSender {
    async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        PooledSender::send(self, Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    /// The parts are queued as a single message
    async fn send_vectored(&self, parts: &[Bytes]) -> anyhow::Result<usize> {
        let message = match parts {
            [single] => single.clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len()).sum());
                for part in parts {
                    buf.put_slice(part);
                }
                buf.freeze()
            }
        };
        let len = message.len();
        PooledSender::send(self, message);
        Ok(len)
    }

    fn is_connected(&self) -> bool {
        self.shared.transport()
            .map_or(false, |t| t.is_connected())
    }

    fn total_bytes_sent(&self) -> u64 {
        self.shared.transport()
            .map_or(0, |t| t.total_bytes_sent())
    }
}
