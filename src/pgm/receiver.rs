use crate::config::ReceiveOptions;
use crate::pgm::listener::{AcceptSocketHandler, ListenerState, PgmListener};
use crate::pgm::{DatagramConnection, DisconnectReason, SocketProvider};
use crate::transport::{ReceiveEvent, ReceiveHandler, ReceiveSource};
use crate::util::observers::{Observers, SubscriptionId};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

/// Decides whether a connection from a remote endpoint is accepted. Returning `false` vetoes
///  the connection, which is then closed without starting a receive loop.
#[cfg_attr(test, automock)]
pub trait AcceptHandler: Send + Sync + 'static {
    fn on_accept(&self, remote: SocketAddr) -> bool;
}

#[cfg_attr(test, automock)]
pub trait DisconnectHandler: Send + Sync + 'static {
    fn on_disconnect(&self, remote: SocketAddr, reason: DisconnectReason);
}

struct ReceiveLoop {
    id: u64,
    handle: JoinHandle<()>,
}

struct PgmReceiverShared {
    accept_handlers: Observers<dyn AcceptHandler>,
    receive_handlers: Observers<dyn ReceiveHandler>,
    disconnect_handlers: Observers<dyn DisconnectHandler>,

    /// at most one receive loop per remote endpoint
    endpoints: Mutex<FxHashMap<SocketAddr, ReceiveLoop>>,
    next_loop_id: AtomicU64,
    bytes_received: AtomicU64,
}

impl PgmReceiverShared {
    fn is_vetoed(&self, remote: SocketAddr) -> bool {
        // every accept handler is asked, even after a veto
        self.accept_handlers.snapshot()
            .iter()
            .fold(false, |vetoed, h| !h.on_accept(remote) || vetoed)
    }

    fn notify_receive(&self, event: &ReceiveEvent) {
        self.bytes_received.fetch_add(event.data.len() as u64, Ordering::Relaxed);
        for handler in self.receive_handlers.snapshot() {
            handler.on_receive(event);
        }
    }

    fn notify_disconnect(&self, remote: SocketAddr, reason: DisconnectReason) {
        for handler in self.disconnect_handlers.snapshot() {
            handler.on_disconnect(remote, reason);
        }
    }

    /// Removes the endpoint's table entry if it still belongs to the loop with the given id, i.e.
    ///  if it was not replaced by a newer connection from the same endpoint
    fn remove_loop(&self, remote: SocketAddr, loop_id: u64) -> bool {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.get(&remote).map(|l| l.id) == Some(loop_id) {
            endpoints.remove(&remote);
            true
        }
        else {
            false
        }
    }
}

/// Registered with the listener, starts a receive loop for every accepted connection
struct ReceiveLoopStarter {
    shared: Arc<PgmReceiverShared>,
}

impl AcceptSocketHandler for ReceiveLoopStarter {
    fn on_accept_socket(&self, connection: Box<dyn DatagramConnection>, remote: SocketAddr) {
        if self.shared.is_vetoed(remote) {
            info!("connection from {:?} was vetoed - closing it", remote);
            return;
        }

        let id = self.shared.next_loop_id.fetch_add(1, Ordering::Relaxed);

        // spawning and registering under the lock, so a loop that terminates immediately finds
        //  its own entry
        let mut endpoints = self.shared.endpoints.lock().unwrap();
        let handle = tokio::spawn(
            receive_loop(self.shared.clone(), id, connection, remote)
                .instrument(info_span!("pgm_receive", remote = %remote))
        );
        if let Some(previous) = endpoints.insert(remote, ReceiveLoop { id, handle }) {
            debug!("new connection from {:?} replaces the existing one", remote);
            previous.handle.abort();
        }
    }
}

async fn receive_loop(shared: Arc<PgmReceiverShared>, loop_id: u64, mut connection: Box<dyn DatagramConnection>, remote: SocketAddr) {
    debug!("starting receive loop");

    let reason = loop {
        match connection.recv().await {
            Ok(Some(data)) => {
                trace!("received {} bytes", data.len());
                shared.notify_receive(&ReceiveEvent { remote, data });
            }
            Ok(None) => break DisconnectReason::Closed,
            Err(e) => {
                debug!("receive failed: {}", e);
                break DisconnectReason::Error(e.kind());
            }
        }
    };

    drop(connection);
    if shared.remove_loop(remote, loop_id) {
        debug!("receive loop terminated: {:?}", reason);
        shared.notify_disconnect(remote, reason);
    }
    else {
        debug!("receive loop terminated after it was replaced or disconnected: {:?}", reason);
    }
}

/// The receiving side of the reliable multicast transport: accepts connections and runs a
///  receive loop per remote endpoint. Received datagrams are delivered to [ReceiveHandler]s on
///  the receive loop's task, so handlers should return quickly - wrap the receiver in a
///  [PooledReceiver](crate::pooled_receiver::PooledReceiver) to process messages on a worker
///  task.
///
/// A new connection from an endpoint that is already connected replaces the existing
///  connection. Disconnect handlers are notified when a receive loop ends because the peer
///  closed the connection or the connection failed, not when it is replaced or disconnected
///  locally.
pub struct PgmReceiver {
    listener: PgmListener,
    shared: Arc<PgmReceiverShared>,
}

impl PgmReceiver {
    pub fn new(provider: Arc<dyn SocketProvider>, bind_addr: SocketAddr, options: ReceiveOptions) -> anyhow::Result<PgmReceiver> {
        Ok(PgmReceiver {
            listener: PgmListener::new(provider, bind_addr, options)?,
            shared: Arc::new(PgmReceiverShared {
                accept_handlers: Observers::new(),
                receive_handlers: Observers::new(),
                disconnect_handlers: Observers::new(),
                endpoints: Mutex::new(FxHashMap::default()),
                next_loop_id: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.listener.start(Arc::new(ReceiveLoopStarter {
            shared: self.shared.clone(),
        })).await
    }

    /// Stops the listener and closes all connections
    pub fn stop(&self) {
        self.listener.stop();

        let loops = std::mem::take(&mut *self.shared.endpoints.lock().unwrap());
        if !loops.is_empty() {
            debug!("closing {} connections", loops.len());
        }
        for (_, receive_loop) in loops {
            receive_loop.handle.abort();
        }
    }

    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connected_endpoints(&self) -> Vec<SocketAddr> {
        self.shared.endpoints.lock().unwrap()
            .keys()
            .copied()
            .collect()
    }

    /// Closes the connection from an endpoint, returning `false` if there was none
    pub fn disconnect(&self, remote: SocketAddr) -> bool {
        match self.shared.endpoints.lock().unwrap().remove(&remote) {
            Some(receive_loop) => {
                debug!("disconnecting {:?}", remote);
                receive_loop.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn subscribe_accept(&self, handler: Arc<dyn AcceptHandler>) -> SubscriptionId {
        self.shared.accept_handlers.subscribe(handler)
    }

    pub fn unsubscribe_accept(&self, id: SubscriptionId) -> bool {
        self.shared.accept_handlers.unsubscribe(id)
    }

    pub fn subscribe_disconnect(&self, handler: Arc<dyn DisconnectHandler>) -> SubscriptionId {
        self.shared.disconnect_handlers.subscribe(handler)
    }

    pub fn unsubscribe_disconnect(&self, id: SubscriptionId) -> bool {
        self.shared.disconnect_handlers.unsubscribe(id)
    }
}

impl Drop for PgmReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ReceiveSource for PgmReceiver {
    fn subscribe(&self, handler: Arc<dyn ReceiveHandler>) -> SubscriptionId {
        self.shared.receive_handlers.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.receive_handlers.unsubscribe(id)
    }

    fn total_bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgm::{ListenSocket, MockSocketProvider};
    use async_trait::async_trait;
    use crate::test_util::handler::CollectingReceiveHandler;
    use bytes::Bytes;
    use std::io;
    use std::io::ErrorKind;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10,0,0,n], 1000))
    }

    /// A connection that returns what is sent through the channel. Dropping the sender makes the
    ///  connection report an orderly close.
    struct ChannelConnection {
        data: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    }

    #[async_trait]
    impl DatagramConnection for ChannelConnection {
        async fn recv(&mut self) -> io::Result<Option<Bytes>> {
            match self.data.recv().await {
                Some(Ok(data)) => Ok(Some(data)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }

    fn channel_connection() -> (mpsc::UnboundedSender<io::Result<Bytes>>, Box<dyn DatagramConnection>) {
        let (send, data) = mpsc::unbounded_channel();
        (send, Box::new(ChannelConnection { data }))
    }

    /// A listen socket that accepts the connections sent through the channel
    struct ChannelListenSocket {
        accepts: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Box<dyn DatagramConnection>, SocketAddr)>>,
    }

    #[async_trait]
    impl ListenSocket for ChannelListenSocket {
        async fn accept(&self) -> io::Result<(Box<dyn DatagramConnection>, SocketAddr)> {
            self.accepts.lock().await
                .recv().await
                .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127,0,0,1], 4530)))
        }

        fn close(&self) {}
    }

    async fn receiver_with_accepts() -> (PgmReceiver, mpsc::UnboundedSender<(Box<dyn DatagramConnection>, SocketAddr)>) {
        let (send, accepts) = mpsc::unbounded_channel();
        let socket: Arc<dyn ListenSocket> = Arc::new(ChannelListenSocket {
            accepts: tokio::sync::Mutex::new(accepts),
        });

        let mut provider = MockSocketProvider::new();
        provider.expect_bind_listener()
            .returning(move |_, _| Ok(socket.clone()));

        let receiver = PgmReceiver::new(Arc::new(provider), SocketAddr::from(([127,0,0,1], 4530)), Default::default()).unwrap();
        receiver.start().await.unwrap();
        (receiver, send)
    }

    struct RecordingDisconnectHandler {
        disconnects: mpsc::UnboundedSender<(SocketAddr, DisconnectReason)>,
    }
    impl DisconnectHandler for RecordingDisconnectHandler {
        fn on_disconnect(&self, remote: SocketAddr, reason: DisconnectReason) {
            let _ = self.disconnects.send((remote, reason));
        }
    }

    fn recording_disconnect_handler() -> (Arc<RecordingDisconnectHandler>, mpsc::UnboundedReceiver<(SocketAddr, DisconnectReason)>) {
        let (disconnects, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingDisconnectHandler { disconnects }), receiver)
    }

    async fn next_disconnect(disconnects: &mut mpsc::UnboundedReceiver<(SocketAddr, DisconnectReason)>) -> (SocketAddr, DisconnectReason) {
        tokio::time::timeout(Duration::from_secs(5), disconnects.recv()).await
            .expect("timed out waiting for disconnect")
            .expect("channel closed")
    }

    async fn wait_for_endpoints(receiver: &PgmReceiver, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while receiver.connected_endpoints().len() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await
            .expect("timed out waiting for endpoints");
    }

    #[tokio::test]
    async fn test_receive_and_close() {
        let (receiver, accepts) = receiver_with_accepts().await;
        let handler = CollectingReceiveHandler::new();
        receiver.subscribe(handler.clone());
        let (disconnect_handler, mut disconnects) = recording_disconnect_handler();
        receiver.subscribe_disconnect(disconnect_handler);

        let (data, connection) = channel_connection();
        accepts.send((connection, peer(1))).ok().unwrap();

        data.send(Ok(Bytes::from_static(b"hello"))).unwrap();
        data.send(Ok(Bytes::from_static(b"world"))).unwrap();
        assert_eq!(handler.next().await, ReceiveEvent { remote: peer(1), data: Bytes::from_static(b"hello") });
        assert_eq!(handler.next().await, ReceiveEvent { remote: peer(1), data: Bytes::from_static(b"world") });
        assert_eq!(receiver.total_bytes_received(), 10);
        assert_eq!(receiver.connected_endpoints(), vec![peer(1)]);

        drop(data);
        assert_eq!(next_disconnect(&mut disconnects).await, (peer(1), DisconnectReason::Closed));
        assert!(receiver.connected_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_on_error() {
        let (receiver, accepts) = receiver_with_accepts().await;
        let (disconnect_handler, mut disconnects) = recording_disconnect_handler();
        receiver.subscribe_disconnect(disconnect_handler);

        let (data, connection) = channel_connection();
        accepts.send((connection, peer(2))).ok().unwrap();
        wait_for_endpoints(&receiver, 1).await;

        data.send(Err(io::Error::from(ErrorKind::ConnectionReset))).unwrap();
        assert_eq!(next_disconnect(&mut disconnects).await, (peer(2), DisconnectReason::Error(ErrorKind::ConnectionReset)));
        assert!(receiver.connected_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_veto() {
        let (receiver, accepts) = receiver_with_accepts().await;

        let mut accept_handler = MockAcceptHandler::new();
        accept_handler.expect_on_accept()
            .returning(|remote| remote != peer(66));
        receiver.subscribe_accept(Arc::new(accept_handler));

        let (_vetoed_data, vetoed) = channel_connection();
        accepts.send((vetoed, peer(66))).ok().unwrap();
        let (_accepted_data, accepted) = channel_connection();
        accepts.send((accepted, peer(1))).ok().unwrap();

        wait_for_endpoints(&receiver, 1).await;
        assert_eq!(receiver.connected_endpoints(), vec![peer(1)]);
    }

    #[tokio::test]
    async fn test_new_connection_replaces_existing() {
        let (receiver, accepts) = receiver_with_accepts().await;
        let handler = CollectingReceiveHandler::new();
        receiver.subscribe(handler.clone());
        let (disconnect_handler, mut disconnects) = recording_disconnect_handler();
        receiver.subscribe_disconnect(disconnect_handler);

        let (first_data, first) = channel_connection();
        accepts.send((first, peer(1))).ok().unwrap();
        first_data.send(Ok(Bytes::from_static(b"first"))).unwrap();
        assert_eq!(handler.next().await.data, Bytes::from_static(b"first"));

        let (second_data, second) = channel_connection();
        accepts.send((second, peer(1))).ok().unwrap();
        second_data.send(Ok(Bytes::from_static(b"second"))).unwrap();
        assert_eq!(handler.next().await.data, Bytes::from_static(b"second"));
        assert_eq!(receiver.connected_endpoints(), vec![peer(1)]);

        // the replaced loop neither removes the new entry nor raises a disconnect
        drop(second_data);
        assert_eq!(next_disconnect(&mut disconnects).await, (peer(1), DisconnectReason::Closed));
        assert!(receiver.connected_endpoints().is_empty());
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_disconnect() {
        let (receiver, accepts) = receiver_with_accepts().await;

        let (_data, connection) = channel_connection();
        accepts.send((connection, peer(5))).ok().unwrap();
        wait_for_endpoints(&receiver, 1).await;

        assert!(receiver.disconnect(peer(5)));
        assert!(!receiver.disconnect(peer(5)));
        assert!(receiver.connected_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_stale_loop_does_not_notify_disconnect() {
        let receiver = PgmReceiver::new(Arc::new(MockSocketProvider::new()), SocketAddr::from(([127,0,0,1], 4530)), Default::default()).unwrap();
        let (disconnect_handler, mut disconnects) = recording_disconnect_handler();
        receiver.subscribe_disconnect(disconnect_handler);

        // the loop's entry is gone, as after a replacement or a local disconnect
        let (data, connection) = channel_connection();
        drop(data);
        receive_loop(receiver.shared.clone(), 17, connection, peer(3)).await;

        assert!(disconnects.try_recv().is_err());
        assert!(receiver.connected_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_stop() {
        let (receiver, accepts) = receiver_with_accepts().await;
        assert_eq!(receiver.state(), ListenerState::Running);

        let (_data, connection) = channel_connection();
        accepts.send((connection, peer(7))).ok().unwrap();
        wait_for_endpoints(&receiver, 1).await;

        receiver.stop();
        assert_eq!(receiver.state(), ListenerState::Stopped);
        assert!(receiver.connected_endpoints().is_empty());
    }
}
