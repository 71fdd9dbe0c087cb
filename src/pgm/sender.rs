use crate::config::SendOptions;
use crate::error::{is_transient_io_error, TransportError};
use crate::pgm::{DatagramSendSocket, SocketProvider};
use crate::transport::SendTransport;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// The sending side of the reliable multicast transport.
///
/// Sends are serialized on the sender's socket, and each send completes when the socket
///  accepted the data. Use a [PooledSender](crate::pooled_sender::PooledSender) to decouple
///  callers from socket I/O.
pub struct PgmSender {
    provider: Arc<dyn SocketProvider>,
    bind_addr: SocketAddr,
    send_addr: SocketAddr,
    options: SendOptions,

    socket: tokio::sync::Mutex<Option<Box<dyn DatagramSendSocket>>>,
    connected: AtomicBool,
    /// set by the first successful connect and cleared by close: a missing socket then means
    ///  that a reconnect failed
    was_connected: AtomicBool,
    bytes_sent: AtomicU64,
}

impl PgmSender {
    pub fn new(provider: Arc<dyn SocketProvider>, bind_addr: SocketAddr, send_addr: SocketAddr, options: SendOptions) -> anyhow::Result<PgmSender> {
        options.validate()?;

        Ok(PgmSender {
            provider,
            bind_addr,
            send_addr,
            options,
            socket: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn send_addr(&self) -> SocketAddr {
        self.send_addr
    }

    pub fn options(&self) -> &SendOptions {
        &self.options
    }

    /// (Re-)connects the sender: an existing socket is closed, and a new one is bound to the
    ///  sender's bind address with the sender's rate and window settings
    pub async fn connect(&self) -> anyhow::Result<()> {
        let mut socket = self.socket.lock().await;

        if let Some(mut previous) = socket.take() {
            debug!("closing previous socket to {:?}", self.send_addr);
            self.connected.store(false, Ordering::Release);
            previous.close().await;
        }

        *socket = Some(self.provider.connect(self.bind_addr, self.send_addr, &self.options).await?);
        self.connected.store(true, Ordering::Release);
        self.was_connected.store(true, Ordering::Release);

        info!("connected to {:?} at {} kbit/s, window {} ms ({} bytes)",
            self.send_addr, self.options.rate_kbits_per_sec, self.options.window_size_msecs, self.options.window_size_bytes());
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(mut socket) = self.socket.lock().await.take() {
            debug!("closing socket to {:?}", self.send_addr);
            socket.close().await;
        }
        self.connected.store(false, Ordering::Release);
        self.was_connected.store(false, Ordering::Release);
    }

    fn no_socket(&self) -> anyhow::Error {
        if self.was_connected.load(Ordering::Acquire) {
            io::Error::new(ErrorKind::NotConnected, format!("connection to {:?} was lost", self.send_addr)).into()
        }
        else {
            TransportError::InvalidOperation("send before connect").into()
        }
    }

    fn on_sent(&self, result: std::io::Result<usize>) -> anyhow::Result<usize> {
        match result {
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => {
                if is_transient_io_error(&e) {
                    self.connected.store(false, Ordering::Release);
                }
                Err(e.into())
            }
        }
    }

    /// Sends the range `[offset, offset+len)` of a buffer as one datagram
    pub async fn send_range(&self, data: &[u8], offset: usize, len: usize) -> anyhow::Result<usize> {
        let range = offset.checked_add(len)
            .filter(|&end| end <= data.len())
            .map(|end| offset..end)
            .ok_or(TransportError::InvalidOperation("send range exceeds the buffer"))?;
        self.send(&data[range]).await
    }

    /// Sends a list of buffers as one datagram
    pub async fn send_ranges(&self, parts: &[Bytes]) -> anyhow::Result<usize> {
        self.send_vectored(parts).await
    }
}

#[async_trait]
impl SendTransport for PgmSender {
    async fn send(&self, data: &[u8]) -> anyhow::Result<usize> {
        let mut socket = self.socket.lock().await;
        let socket = socket.as_mut().ok_or_else(|| self.no_socket())?;
        let result = socket.send(data).await;
        self.on_sent(result)
    }

    async fn send_vectored(&self, parts: &[Bytes]) -> anyhow::Result<usize> {
        let mut socket = self.socket.lock().await;
        let socket = socket.as_mut().ok_or_else(|| self.no_socket())?;
        let result = socket.send_vectored(parts).await;
        self.on_sent(result)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
