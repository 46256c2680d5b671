//! TCP server for framed XML transactions.
//!
//! The accept loop runs on its own thread and hands every accepted
//! connection to the worker pool as a [`ConnectionHandler`] task. Shutdown
//! is coordinated through a set-once flag plus closing the listening socket,
//! which is what unblocks a pending `accept`.

use crate::config::Config;
use crate::error::{ProtocolError, Result};
use crate::listener::{Listener, SocketEvent, TID_UNAVAILABLE};
use crate::runtime::{CancelToken, Connection, ConnectionHandler, WorkerPool};
use crate::shutdown_log::ShutdownLog;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pending connection backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 128;

/// How long the self-connect used to wake `accept` may take.
const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

/// Result of closing the listening socket.
#[derive(Debug)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
    /// The socket was released but shutting it down reported an error.
    Failed(io::Error),
}

/// State shared by the accept thread, connection handlers and the owner.
struct Shared {
    shutdown: AtomicBool,
    /// Duplicate of the listening socket, kept so other threads can close it.
    control: Mutex<Option<Socket>>,
    accept_cancel: CancelToken,
    local_addr: SocketAddr,
}

impl Shared {
    fn terminate_processing(&self) {
        info!(port = self.local_addr.port(), "Request to terminate processing received");
        if let CloseOutcome::Failed(e) = self.close_listener() {
            info!(error = %e, "Ignored error closing listener");
        }
    }

    /// Set the shutdown flag and release the listening socket.
    fn close_listener(&self) -> CloseOutcome {
        self.shutdown.store(true, Ordering::Release);
        let socket = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(socket) = socket else {
            return CloseOutcome::AlreadyClosed;
        };

        let result = socket.shutdown(Shutdown::Both);
        drop(socket);
        self.wake_accept();

        match result {
            Ok(()) => CloseOutcome::Closed,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => CloseOutcome::Closed,
            Err(e) => CloseOutcome::Failed(e),
        }
    }

    /// Connect to ourselves so a blocked `accept` returns on platforms where
    /// shutting down a listening socket does not interrupt it.
    fn wake_accept(&self) {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let target = SocketAddr::new(ip, self.local_addr.port());
        if let Err(e) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
            debug!(error = %e, "Wake-up connect failed; accept already unblocked");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Cheap handle connection handlers use to stop the server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Set the shutdown flag and close the listening socket.
    pub fn terminate_processing(&self) {
        self.shared.terminate_processing();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }
}

/// A running server.
pub struct Server {
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listening socket and start the accept loop.
    ///
    /// Failing to bind is returned to the caller, which is expected to abort
    /// startup.
    pub fn start(
        config: &Config,
        listener: Arc<dyn Listener>,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        let addr = config
            .listen_addr()
            .map_err(|e| ProtocolError::setup("resolve listen address", io::Error::other(e)))?;
        let socket =
            create_listener(addr).map_err(|e| ProtocolError::setup("bind listener", e))?;
        let local_addr = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);
        let control = socket
            .try_clone()
            .map_err(|e| ProtocolError::setup("clone listener", e))?;

        let shared = Arc::new(Shared {
            shutdown: AtomicBool::new(false),
            control: Mutex::new(Some(control)),
            accept_cancel: CancelToken::new(),
            local_addr,
        });

        info!(address = %local_addr, workers = pool.size(), "Server listening");

        let accept = AcceptLoop {
            socket,
            shared: Arc::clone(&shared),
            listener,
            pool,
            read_timeout: config.read_timeout(),
        };
        let accept_thread = thread::Builder::new()
            .name("accept".to_string())
            .spawn(move || accept.run())
            .map_err(|e| ProtocolError::setup("spawn accept thread", e))?;

        Ok(Server {
            shared,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Set the shutdown flag and close the listening socket.
    pub fn terminate_processing(&self) {
        self.shared.terminate_processing();
    }

    /// Ask the accept thread to stop without closing the socket first.
    ///
    /// The loop notices on its next wake-up, sets the shutdown flag and
    /// closes the socket itself.
    pub fn interrupt(&self) {
        self.shared.accept_cancel.cancel();
        self.shared.wake_accept();
    }

    /// Close the listening socket, which also stops the accept loop.
    ///
    /// Idempotent; errors are logged, never returned.
    pub fn close(&self) {
        let port = self.port();
        match self.shared.close_listener() {
            CloseOutcome::Closed => info!(port, "Closed server socket"),
            CloseOutcome::AlreadyClosed => debug!(port, "Server socket already closed"),
            CloseOutcome::Failed(e) => {
                warn!(port, error = %e, "Caught (and muffled) error closing server socket")
            }
        }
    }

    /// Close the listening socket, recording the outcome in `log`.
    ///
    /// Used while the process is exiting and regular logging may already be
    /// gone.
    pub fn close_with_log(&self, log: &mut ShutdownLog) {
        let port = self.port();
        let line = match self.shared.close_listener() {
            CloseOutcome::Closed => format!("Closed server socket on port {port}"),
            CloseOutcome::AlreadyClosed => format!("Server socket on port {port} already closed"),
            CloseOutcome::Failed(e) => {
                format!("Caught (and muffled) error closing server socket on port {port}: {e}")
            }
        };
        if let Err(e) = log.append_line(&line) {
            eprintln!("could not write to shutdown log: {e}");
        }
    }

    /// Block until the accept loop has exited.
    pub fn wait(&self) {
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
    }
}

struct AcceptLoop {
    socket: Socket,
    shared: Arc<Shared>,
    listener: Arc<dyn Listener>,
    pool: Arc<WorkerPool>,
    read_timeout: Option<Duration>,
}

impl AcceptLoop {
    fn run(self) {
        let port = self.shared.local_addr.port();

        while !self.shared.is_shutdown() {
            let stream: TcpStream = match self.socket.accept() {
                Ok((socket, _)) => socket.into(),
                Err(e) => {
                    if self.shared.is_shutdown() {
                        break;
                    }
                    error!(error = %e, "Failed to accept connection");
                    self.listener.handle_error(
                        &SocketEvent::new(TID_UNAVAILABLE, port),
                        &ProtocolError::Transport(e),
                    );
                    break;
                }
            };

            if self.shared.accept_cancel.is_cancelled() {
                info!("Accept loop interrupted");
                break;
            }
            if self.shared.is_shutdown() {
                break;
            }

            let peer = stream.peer_addr().ok();
            info!(peer = ?peer, "New client connection accepted");
            self.dispatch(stream, port);
        }

        self.shared.close_listener();
        info!(port, "Accept loop finished");
    }

    fn dispatch(&self, stream: TcpStream, port: u16) {
        let cancel = CancelToken::new();
        let connection = match Connection::accepted(stream, self.read_timeout, cancel.clone()) {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = %err, "Failed to set up connection");
                self.listener
                    .handle_error(&SocketEvent::new(TID_UNAVAILABLE, port), &err);
                return;
            }
        };

        let mut handler = ConnectionHandler::new(connection, Arc::clone(&self.listener), port)
            .with_server(ServerHandle {
                shared: Arc::clone(&self.shared),
            });

        if self
            .pool
            .execute(cancel, move || {
                handler.run();
            })
            .is_err()
        {
            warn!("Worker pool shut down, dropping connection");
        }
    }
}

/// Create a blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket)
}
