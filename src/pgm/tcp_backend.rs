//! A portable [SocketProvider] that emulates reliable datagram sockets on top of TCP. Every
//!  datagram is written as a little-endian `u32` length prefix followed by the datagram's bytes,
//!  so datagram boundaries survive the stream.

use crate::config::{ReceiveOptions, SendOptions};
use crate::pgm::{DatagramConnection, DatagramSendSocket, ListenSocket, SocketProvider};
use crate::util::int_conv::Widen;
use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::io::{ErrorKind, IoSlice};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound for the OS send buffer that is derived from the send window
const MAX_SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Default)]
pub struct TcpSocketProvider;

#[async_trait]
impl SocketProvider for TcpSocketProvider {
    async fn bind_listener(&self, addr: SocketAddr, options: &ReceiveOptions) -> anyhow::Result<Arc<dyn ListenSocket>> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("could not set SO_REUSEADDR on listen socket: {}", e);
        }
        if let Some(size) = options.socket_receive_buffer_size {
            if let Err(e) = socket.set_recv_buffer_size(size) {
                warn!("could not set receive buffer size to {}: {}", size, e);
            }
        }

        socket.bind(&addr.into())
            .with_context(|| format!("binding listen socket to {:?}", addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let listener = TcpListener::from_std(socket.into())?;
        let (closed, _) = watch::channel(false);

        Ok(Arc::new(TcpListenSocket {
            listener: Mutex::new(Some(Arc::new(listener))),
            closed,
            max_datagram_size: options.max_datagram_size,
            socket_receive_buffer_size: options.socket_receive_buffer_size,
        }))
    }

    async fn connect(&self, bind_addr: SocketAddr, send_addr: SocketAddr, options: &SendOptions) -> anyhow::Result<Box<dyn DatagramSendSocket>> {
        let socket = if send_addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.bind(bind_addr)
            .with_context(|| format!("binding send socket to {:?}", bind_addr))?;

        let stream = socket.connect(send_addr).await
            .with_context(|| format!("connecting to {:?}", send_addr))?;
        stream.set_nodelay(true)?;

        // the send window is what the OS buffers for the connection
        let send_buffer_size = usize::try_from(options.window_size_bytes())
            .unwrap_or(usize::MAX)
            .min(MAX_SEND_BUFFER_SIZE);
        SockRef::from(&stream).set_send_buffer_size(send_buffer_size)?;

        debug!("connected {:?} -> {:?}, send buffer {} bytes", stream.local_addr()?, send_addr, send_buffer_size);
        Ok(Box::new(TcpDatagramSendSocket {
            stream: Some(stream),
        }))
    }
}

struct TcpListenSocket {
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: watch::Sender<bool>,
    max_datagram_size: usize,
    socket_receive_buffer_size: Option<usize>,
}

#[async_trait]
impl ListenSocket for TcpListenSocket {
    async fn accept(&self) -> io::Result<(Box<dyn DatagramConnection>, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        let listener = self.listener.lock().unwrap().clone()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "listen socket is closed"))?;

        let (stream, remote) = tokio::select! {
            result = listener.accept() => result?,
            _ = closed.wait_for(|closed| *closed) => {
                return Err(io::Error::new(ErrorKind::NotConnected, "listen socket was closed"));
            }
        };

        stream.set_nodelay(true)?;
        if let Some(size) = self.socket_receive_buffer_size {
            if let Err(e) = SockRef::from(&stream).set_recv_buffer_size(size) {
                warn!("could not set receive buffer size for connection from {:?}: {}", remote, e);
            }
        }

        Ok((Box::new(TcpDatagramConnection {
            stream,
            max_datagram_size: self.max_datagram_size,
        }), remote))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener.lock().unwrap().as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(ErrorKind::NotConnected, "listen socket is closed")),
        }
    }

    fn close(&self) {
        self.listener.lock().unwrap().take();
        self.closed.send_replace(true);
    }
}

struct TcpDatagramConnection {
    stream: TcpStream,
    max_datagram_size: usize,
}

#[async_trait]
impl DatagramConnection for TcpDatagramConnection {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        // EOF before the first byte is an orderly close, EOF inside the prefix is a truncation
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.stream.read(&mut len_buf[filled..]).await? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed inside a datagram's length prefix")),
                n => filled += n,
            }
        }

        let len: usize = u32::from_le_bytes(len_buf).widen();
        if len > self.max_datagram_size {
            return Err(io::Error::new(ErrorKind::InvalidData, format!(
                "received a datagram of {} bytes, exceeding the configured maximum of {}", len, self.max_datagram_size
            )));
        }

        let mut buf = BytesMut::zeroed(len);
        self.stream.read_exact(&mut buf).await?;
        Ok(Some(buf.freeze()))
    }
}

struct TcpDatagramSendSocket {
    stream: Option<TcpStream>,
}

impl TcpDatagramSendSocket {
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "send socket is closed"))
    }

    async fn write_datagram(&mut self, len: usize, parts: &[&[u8]]) -> io::Result<usize> {
        let prefix = u32::try_from(len)
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "datagram is too big for a u32 length prefix"))?
            .to_le_bytes();
        let stream = self.stream()?;

        let mut pending: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        pending.push(&prefix);
        pending.extend(parts.iter().copied().filter(|p| !p.is_empty()));

        // vectored writes straight from the parts' buffers, resuming after partial writes
        let mut first = 0;
        while first < pending.len() {
            let slices: Vec<IoSlice> = pending[first..].iter()
                .map(|p| IoSlice::new(p))
                .collect();
            let mut written = stream.write_vectored(&slices).await?;
            if written == 0 {
                return Err(io::Error::from(ErrorKind::WriteZero));
            }

            while written > 0 {
                let head = pending[first];
                if written >= head.len() {
                    written -= head.len();
                    first += 1;
                }
                else {
                    pending[first] = &head[written..];
                    written = 0;
                }
            }
        }
        Ok(len)
    }
}

#[async_trait]
impl DatagramSendSocket for TcpDatagramSendSocket {
    async fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_datagram(data.len(), &[data]).await
    }

    async fn send_vectored(&mut self, parts: &[Bytes]) -> io::Result<usize> {
        let len = parts.iter().map(|p| p.len()).sum();
        let parts: Vec<&[u8]> = parts.iter().map(|p| p.as_ref()).collect();
        self.write_datagram(len, &parts).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("error shutting down send socket: {}", e);
            }
        }
    }
}
