use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

pub struct PooledSenderConfig {
    /// If `true`, messages are collected into batch frames and sent as a single write; the
    ///  receiving side must un-batch them with a batched
    ///  [PooledReceiver](crate::pooled_receiver::PooledReceiver).
    pub batched: bool,

    /// The frame size (in bytes, including the batch header) at which a batch is flushed.
    ///  Batches are never held back waiting for data beyond the messages already queued, so
    ///  most batches are smaller than this in practice.
    ///
    /// A single message bigger than this is sent as a batch of its own.
    pub package_size: usize,

    /// Upper bound for the number of queued messages that are processed in a single pass of the
    ///  sender's worker before pending batch contents are flushed
    pub max_messages_per_pass: usize,
}

impl Default for PooledSenderConfig {
    fn default() -> Self {
        PooledSenderConfig {
            batched: false,
            package_size: 32 * 1024,
            max_messages_per_pass: 1024,
        }
    }
}

impl PooledSenderConfig {
    pub fn batched() -> PooledSenderConfig {
        PooledSenderConfig {
            batched: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.package_size <= crate::batch_message::BatchMessage::HEADER_LEN {
            bail!("package size must be bigger than the batch header");
        }
        if self.package_size > u32::MAX as usize {
            bail!("package size must fit the batch header's u32 size field");
        }
        if self.max_messages_per_pass == 0 {
            bail!("a pass must process at least one message");
        }
        Ok(())
    }
}

pub struct PooledReceiverConfig {
    /// If `true`, every received buffer is expected to be a batch frame, and its messages are
    ///  delivered individually
    pub batched: bool,

    pub max_packages_per_pass: usize,
}

impl Default for PooledReceiverConfig {
    fn default() -> Self {
        PooledReceiverConfig {
            batched: false,
            max_packages_per_pass: 256,
        }
    }
}

impl PooledReceiverConfig {
    pub fn batched() -> PooledReceiverConfig {
        PooledReceiverConfig {
            batched: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packages_per_pass == 0 {
            bail!("a pass must process at least one package");
        }
        Ok(())
    }
}

/// Rate and window settings for the sending side of the reliable multicast transport. The
///  sender keeps data for re-transmission for the duration of the send window, so the window
///  size in bytes follows from the rate and the window duration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOptions {
    pub rate_kbits_per_sec: u32,
    pub window_size_msecs: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            rate_kbits_per_sec: 100 * 1024 * 8,
            window_size_msecs: 5_000,
        }
    }
}

impl SendOptions {
    /// kbit/s divided by 8 is kbyte/s, which is bytes per millisecond
    pub fn window_size_bytes(&self) -> u64 {
        (self.rate_kbits_per_sec as u64 / 8) * self.window_size_msecs as u64
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_kbits_per_sec < 8 {
            bail!("send rate must be at least 8 kbit/s");
        }
        if self.window_size_msecs == 0 {
            bail!("send window must not be empty");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Datagrams bigger than this are treated as a protocol violation, and the connection they
    ///  arrive on is dropped
    pub max_datagram_size: usize,

    /// OS level receive buffer, if it should differ from the OS default
    pub socket_receive_buffer_size: Option<usize>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions {
            max_datagram_size: 16 * 1024 * 1024,
            socket_receive_buffer_size: None,
        }
    }
}

impl ReceiveOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size == 0 {
            bail!("max datagram size must be positive");
        }
        if self.max_datagram_size > u32::MAX as usize {
            bail!("max datagram size must fit into a u32 length prefix");
        }
        Ok(())
    }
}

pub struct SenderPoolConfig {
    /// The number of connected senders the pool keeps
    pub size: usize,

    /// How long [SenderPool::send](crate::sender_pool::SenderPool::send) waits for a sender to
    ///  become available, and how long returning a sender may take
    pub timeout: Duration,

    pub bind_addr: SocketAddr,
    pub send_addr: SocketAddr,
    pub send_options: SendOptions,
}

impl SenderPoolConfig {
    pub fn new(bind_addr: SocketAddr, send_addr: SocketAddr) -> SenderPoolConfig {
        SenderPoolConfig {
            size: 4,
            timeout: Duration::from_secs(5),
            bind_addr,
            send_addr,
            send_options: Default::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.size == 0 {
            bail!("sender pool must contain at least one sender");
        }
        self.send_options.validate()
    }
}
