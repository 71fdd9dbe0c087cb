use crate::config::ReceiveOptions;
use crate::pgm::{DatagramConnection, ListenSocket, SocketProvider};
use anyhow::bail;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

/// Called on the accept loop's task for every accepted connection
pub trait AcceptSocketHandler: Send + Sync + 'static {
    fn on_accept_socket(&self, connection: Box<dyn DatagramConnection>, remote: SocketAddr);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
}

struct ActiveListener {
    socket: Arc<dyn ListenSocket>,
    running: Arc<AtomicBool>,
    accept_loop: JoinHandle<()>,
}

/// Accepts incoming connections on a bound address and hands them to an [AcceptSocketHandler].
///
/// The accept loop keeps going after a connection was reset during accept. Any other accept
///  failure is logged and terminates the loop; the listener stays `Running` but does not accept
///  connections until it goes through a [PgmListener::stop] / [PgmListener::start] cycle.
pub struct PgmListener {
    provider: Arc<dyn SocketProvider>,
    bind_addr: SocketAddr,
    options: ReceiveOptions,
    state: Mutex<ListenerState>,
    /// changed under the state lock by every start and stop, so a start can detect that it was
    ///  overtaken while binding
    generation: AtomicU64,
    active: Mutex<Option<ActiveListener>>,
}

impl PgmListener {
    pub fn new(provider: Arc<dyn SocketProvider>, bind_addr: SocketAddr, options: ReceiveOptions) -> anyhow::Result<PgmListener> {
        options.validate()?;

        Ok(PgmListener {
            provider,
            bind_addr,
            options,
            state: Mutex::new(ListenerState::Stopped),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }

    /// The address the listen socket is actually bound to, if the listener is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().unwrap()
            .as_ref()
            .and_then(|a| a.socket.local_addr().ok())
    }

    /// `true` while the accept loop is alive
    pub fn is_accepting(&self) -> bool {
        self.active.lock().unwrap()
            .as_ref()
            .map(|a| !a.accept_loop.is_finished())
            .unwrap_or(false)
    }

    /// Binds the listen socket and starts the accept loop. Fails if the listener is not stopped,
    ///  or if binding fails (leaving the listener stopped).
    pub async fn start(&self, handler: Arc<dyn AcceptSocketHandler>) -> anyhow::Result<()> {
        let generation = {
            let mut state = self.state.lock().unwrap();
            if *state != ListenerState::Stopped {
                bail!("listener on {:?} can not be started in state {:?}", self.bind_addr, *state);
            }
            *state = ListenerState::Starting;
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        let socket = match self.provider.bind_listener(self.bind_addr, &self.options).await {
            Ok(socket) => socket,
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                if self.generation.load(Ordering::Acquire) == generation {
                    *state = ListenerState::Stopped;
                }
                return Err(e);
            }
        };

        // a stop() during the bind wins: the new socket is closed instead of being installed
        let mut state = self.state.lock().unwrap();
        if *state != ListenerState::Starting || self.generation.load(Ordering::Acquire) != generation {
            drop(state);
            socket.close();
            bail!("listener on {:?} was stopped while starting", self.bind_addr);
        }

        let local_addr = socket.local_addr().unwrap_or(self.bind_addr);
        info!("listening on {:?}", local_addr);

        let running = Arc::new(AtomicBool::new(true));
        let accept_loop = tokio::spawn(
            accept_loop(socket.clone(), handler, running.clone())
                .instrument(info_span!("pgm_listener", addr = %local_addr))
        );

        *self.active.lock().unwrap() = Some(ActiveListener {
            socket,
            running,
            accept_loop,
        });
        *state = ListenerState::Running;
        Ok(())
    }

    /// Stops accepting: outstanding accepts fail, and the listen socket is closed. Calling this
    ///  on a stopped listener does nothing, calling it while the listener is starting makes the
    ///  start fail.
    pub fn stop(&self) {
        let active = {
            let mut state = self.state.lock().unwrap();
            *state = ListenerState::Stopped;
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.active.lock().unwrap().take()
        };

        if let Some(active) = active {
            debug!("stopping listener on {:?}", self.bind_addr);
            active.running.store(false, Ordering::Release);
            active.socket.close();
            active.accept_loop.abort();
        }
    }
}

impl Drop for PgmListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(socket: Arc<dyn ListenSocket>, handler: Arc<dyn AcceptSocketHandler>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match socket.accept().await {
            Ok((connection, remote)) => {
                debug!("accepted connection from {:?}", remote);
                handler.on_accept_socket(connection, remote);
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                debug!("connection was reset during accept - continuing: {}", e);
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    error!("accept failed, listener stops accepting connections: {}", e);
                }
                else {
                    debug!("listen socket closed");
                }
                break;
            }
        }
    }
}
