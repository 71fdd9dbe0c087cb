use crate::config::SenderPoolConfig;
use crate::error::{is_transient, TransportError};
use crate::pgm::sender::PgmSender;
use crate::pgm::SocketProvider;
use crate::transport::SendTransport;
use crate::util::blocking_queue::BlockingQueue;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A sender that can be kept in a [SenderPool]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolableSender: Send + Sync + 'static {
    /// (Re-)connects with the sender's original parameters
    async fn connect(&self) -> anyhow::Result<()>;

    async fn send(&self, data: &[u8]) -> anyhow::Result<usize>;

    async fn close(&self);
}

#[async_trait]
impl PoolableSender for PgmSender {
    async fn connect(&self) -> anyhow::Result<()> {
        PgmSender::connect(self).await
    }

    async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        SendTransport::send(self, data).await
    }

    async fn close(&self) {
        PgmSender::close(self).await
    }
}

/// A sender taken from the pool. It goes back into the pool when the lease is dropped, so a
///  send that is cancelled does not shrink the pool.
struct Lease<'a, S: PoolableSender> {
    pool: &'a SenderPool<S>,
    sender: Option<S>,
}

impl <S: PoolableSender> Lease<'_, S> {
    fn sender(&self) -> &S {
        self.sender.as_ref()
            .expect("sender is present until the lease is dropped")
    }
}

impl <S: PoolableSender> Drop for Lease<'_, S> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            if self.pool.queue.try_enqueue(sender).is_err() {
                // the queue has room for every live sender, so this is a bug
                error!("could not return sender to the pool - dropping it");
                self.pool.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// A fixed number of connected senders that are ready for use. A send takes a sender from the
///  pool (waiting for one to become available), sends and puts the sender back.
///
/// A send that fails with a transient socket error (see [is_transient]) triggers a single
///  reconnect attempt for the sender before the original error is returned to the caller.
pub struct SenderPool<S: PoolableSender> {
    queue: BlockingQueue<S>,
    /// the number of senders owned by the pool, including those that are currently leased
    live: AtomicUsize,
    timeout: Duration,
    closed: AtomicBool,
}

impl SenderPool<PgmSender> {
    /// Creates a pool of connected [PgmSender]s
    pub async fn connect(provider: Arc<dyn SocketProvider>, config: &SenderPoolConfig) -> anyhow::Result<SenderPool<PgmSender>> {
        config.validate()?;
        info!("creating pool of {} senders to {:?}", config.size, config.send_addr);

        SenderPool::new(config.size, config.timeout, || {
            PgmSender::new(provider.clone(), config.bind_addr, config.send_addr, config.send_options.clone())
        }).await
    }
}

impl <S: PoolableSender> SenderPool<S> {
    /// Creates `size` senders and connects them. Fails if creating or connecting any of them
    ///  fails.
    pub async fn new(size: usize, timeout: Duration, mut create_sender: impl FnMut() -> anyhow::Result<S>) -> anyhow::Result<SenderPool<S>> {
        let pool = SenderPool {
            queue: BlockingQueue::new(size),
            live: AtomicUsize::new(0),
            timeout,
            closed: AtomicBool::new(false),
        };

        for _ in 0..size {
            let sender = create_sender()?;
            sender.connect().await?;
            pool.queue.enqueue(sender, timeout).await?;
            pool.live.fetch_add(1, Ordering::AcqRel);
        }
        Ok(pool)
    }

    /// The number of senders that are currently in the pool, i.e. not leased
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_size()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    async fn lease(&self) -> anyhow::Result<Lease<'_, S>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::InvalidOperation("sender pool is closed").into());
        }

        let sender = self.queue.dequeue(self.timeout).await?;
        Ok(Lease {
            pool: self,
            sender: Some(sender),
        })
    }

    /// Sends with a sender from the pool, waiting up to the pool's timeout for a sender to become
    ///  available
    pub async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        let lease = self.lease().await?;

        let result = lease.sender().send(data).await;
        if let Err(e) = &result {
            if is_transient(e) {
                warn!("transient error sending, reconnecting: {:#}", e);
                if let Err(reconnect_error) = lease.sender().connect().await {
                    warn!("reconnecting failed: {:#}", reconnect_error);
                }
            }
        }
        result
    }

    /// Closes all senders. This waits for leased senders to be returned, but no longer than the
    ///  pool's timeout per sender.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);

        while self.live.load(Ordering::Acquire) > 0 {
            let sender = self.queue.dequeue(self.timeout).await?;
            sender.close().await;
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("sender pool closed");
        Ok(())
    }
}
