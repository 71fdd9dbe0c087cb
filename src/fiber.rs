//! A fiber is a single-consumer worker task with a FIFO queue: any number of producers enqueue
//!  items, and the fiber processes them strictly one pass at a time, in the order they were
//!  enqueued. This gives per-instance ordering and mutual exclusion without locks on the hot
//!  path.

use async_trait::async_trait;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, Instrument};

/// The processing logic running inside a [Fiber].
#[async_trait]
pub trait FiberWorker<T: Send + 'static>: Send + 'static {
    /// Processes the items that were waiting in the queue when the pass started, in the order
    ///  they were enqueued. A pass is never interleaved with another pass.
    async fn process_pass(&mut self, items: Vec<T>);
}

pub struct Fiber<T: Send + 'static> {
    name: String,
    sender: RwLock<Option<mpsc::UnboundedSender<T>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl <T: Send + 'static> Fiber<T> {
    /// Spawns the fiber's worker task on the current tokio runtime. A pass processes at most
    ///  `max_pass_len` items.
    pub fn spawn(name: impl Into<String>, mut worker: impl FiberWorker<T>, max_pass_len: usize) -> Fiber<T> {
        assert!(max_pass_len > 0);
        let name = name.into();

        let (sender, mut receiver) = mpsc::unbounded_channel::<T>();

        let handle = tokio::spawn(async move {
            let mut items = Vec::with_capacity(max_pass_len);
            while receiver.recv_many(&mut items, max_pass_len).await > 0 {
                trace!("processing {} items", items.len());
                worker.process_pass(std::mem::take(&mut items)).await;
            }
            debug!("queue closed - terminating");
        }.instrument(info_span!("fiber", name = %name)));

        Fiber {
            name,
            sender: RwLock::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` if the fiber is closed, dropping the item
    pub fn enqueue(&self, item: T) -> bool {
        match self.sender.read().unwrap().as_ref() {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().unwrap().is_none()
    }

    /// Stops accepting new items. Items that are already queued are still processed.
    pub fn close(&self) {
        if self.sender.write().unwrap().take().is_some() {
            debug!("closing fiber {}", self.name);
        }
    }

    /// Closes the fiber and waits until all queued items are processed
    pub async fn close_and_wait(&self) {
        self.close();

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("fiber {} terminated abnormally: {}", self.name, e);
            }
        }
    }
}

impl <T: Send + 'static> Drop for Fiber<T> {
    fn drop(&mut self) {
        self.close();
    }
}
