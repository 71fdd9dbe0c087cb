use crate::util::observers::SubscriptionId;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;

/// The sending half of a transport. Implemented by the raw transports (e.g.
///  [crate::pgm::sender::PgmSender]) as well as by the wrappers around them, e.g.
///  [crate::pooled_sender::PooledSender].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendTransport: Send + Sync + 'static {
    /// Sends a buffer as a single message, returning the number of bytes sent
    async fn send(&self, data: &[u8]) -> anyhow::Result<usize>;

    /// Sends several buffers as a single message. The default implementation copies them into
    ///  one buffer; transports that support vectored I/O should override it.
    async fn send_vectored(&self, parts: &[Bytes]) -> anyhow::Result<usize> {
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            buf.put_slice(part);
        }
        self.send(&buf).await
    }

    fn is_connected(&self) -> bool;

    fn total_bytes_sent(&self) -> u64;
}

/// A received message and the endpoint it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveEvent {
    pub remote: SocketAddr,
    pub data: Bytes,
}

/// Handles received messages. Handlers are called on the receiving transport's I/O task, so
///  they should return quickly - [crate::pooled_receiver::PooledReceiver] is the tool for moving
///  processing off the I/O task.
#[cfg_attr(test, automock)]
pub trait ReceiveHandler: Send + Sync + 'static {
    fn on_receive(&self, event: &ReceiveEvent);
}

/// The receiving half of a transport
pub trait ReceiveSource: Send + Sync + 'static {
    fn subscribe(&self, handler: Arc<dyn ReceiveHandler>) -> SubscriptionId;

    /// returns `false` if there was no such subscription
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn total_bytes_received(&self) -> u64;
}
