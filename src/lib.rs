//! Reliable batched socket transport.
//!
//! This crate moves application-level messages over a reliable datagram transport, decoupling
//!  the threads / tasks that produce or consume messages from the actual socket I/O:
//!
//! * [batch_message::BatchMessage] packs many small messages into a single frame so that they
//!    go over the wire in one write
//! * [pooled_sender::PooledSender] and [pooled_receiver::PooledReceiver] run all send / receive
//!    processing of one instance on a dedicated worker task ("fiber"), optionally batching and
//!    un-batching messages
//! * [pgm] is a connection-oriented reliable multicast transport with an accept loop, per-peer
//!    receive loops and a connect / send / close sender
//! * [sender_pool::SenderPool] keeps a fixed number of connected senders ready for use and
//!    reconnects them after transient errors
//!
//! ## Batch frame
//!
//! All numbers are little-endian `u32`:
//!
//! ```ascii
//! 0: total size of the frame in bytes, including this header
//! 4: number of messages in the frame
//! 8: (repeated) message length, followed by the message's bytes
//! ```
//!
//! The pooled wrappers implement the same [transport::SendTransport] and
//!  [transport::ReceiveSource] contracts as the transports they wrap, so application code can
//!  switch between raw and pooled / batched transports without changes.

pub mod batch_message;
pub mod config;
pub mod error;
pub mod fiber;
pub mod pgm;
pub mod pooled_receiver;
pub mod pooled_sender;
pub mod sender_pool;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;
