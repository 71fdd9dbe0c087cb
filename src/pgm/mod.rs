//! Connection-oriented reliable multicast transport.
//!
//! A [listener::PgmListener] runs an accept loop on a listen socket; a [receiver::PgmReceiver]
//!  builds on it, running one receive loop per accepted remote endpoint and surfacing receive
//!  and disconnect events; a [sender::PgmSender] connects to a group address and sends
//!  datagrams with rate / window settings applied to the socket.
//!
//! The reliable datagram socket itself is abstracted behind [SocketProvider] and the socket
//!  traits in this module. [tcp_backend::TcpSocketProvider] is a portable provider that
//!  preserves datagram boundaries over TCP streams.

pub mod listener;
pub mod receiver;
pub mod sender;
pub mod tcp_backend;

use crate::config::{ReceiveOptions, SendOptions};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Creates the sockets for the reliable multicast transport
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketProvider: Send + Sync + 'static {
    async fn bind_listener(&self, addr: SocketAddr, options: &ReceiveOptions) -> anyhow::Result<Arc<dyn ListenSocket>>;

    async fn connect(&self, bind_addr: SocketAddr, send_addr: SocketAddr, options: &SendOptions) -> anyhow::Result<Box<dyn DatagramSendSocket>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ListenSocket: Send + Sync + 'static {
    /// Waits for the next incoming connection. Fails after [ListenSocket::close] was called,
    ///  including for calls that are already waiting.
    async fn accept(&self) -> io::Result<(Box<dyn DatagramConnection>, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn close(&self);
}

/// The receiving end of an accepted connection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramConnection: Send + 'static {
    /// Returns the next datagram, or `None` when the peer closed the connection in an orderly
    ///  fashion
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSendSocket: Send + Sync + 'static {
    /// Sends a buffer as one datagram
    async fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Sends several buffers as one datagram
    async fn send_vectored(&mut self, parts: &[Bytes]) -> io::Result<usize>;

    async fn close(&mut self);
}

/// Why a per-endpoint receive loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// the peer closed the connection
    Closed,
    /// the connection failed with a socket error
    Error(io::ErrorKind),
}
