//! Demonstration application wired around the server.
//!
//! Accepts every message, answers `CONSUME_RESPOND` with a fixed XML
//! envelope, and lets any peer shut the process down. SIGINT and SIGTERM
//! take the same shutdown path.

use crate::config::Config;
use crate::error::{ProtocolError, Result};
use crate::listener::{Listener, SocketEvent};
use crate::runtime::WorkerPool;
use crate::server::{Server, ServerHandle};
use crate::shutdown_log::ShutdownLog;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Listener that logs what it sees and agrees to everything.
#[derive(Debug, Default)]
pub struct DemoListener;

impl DemoListener {
    fn response_for(tid: &str) -> String {
        format!(
            "<APP_DEFINED_RESPONSE><KEY>{tid}</KEY><STATUS>SUCCESS</STATUS></APP_DEFINED_RESPONSE>"
        )
    }
}

impl Listener for DemoListener {
    fn message_received(&self, event: &SocketEvent) -> bool {
        info!(
            tid = %event.tid,
            port = event.port,
            payload = event.message.as_deref().unwrap_or_default(),
            "Message received"
        );
        true
    }

    fn message_received_and_want_response(&self, event: &SocketEvent) -> Option<String> {
        info!(
            tid = %event.tid,
            port = event.port,
            payload = event.message.as_deref().unwrap_or_default(),
            "Message received, response requested"
        );
        Some(Self::response_for(&event.tid))
    }

    fn handle_error(&self, event: &SocketEvent, error: &ProtocolError) {
        error!(tid = %event.tid, port = event.port, code = error.code(), error = %error, "Connection error");
    }

    fn can_close_server_socket(&self, event: &SocketEvent) -> bool {
        info!(tid = %event.tid, port = event.port, "Granting shutdown request");
        true
    }
}

/// Stops the server from outside any connection, e.g. on Ctrl-C.
///
/// Triggering only terminates processing; [`App::wait`] then runs the
/// usual close, drain and shutdown-log sequence.
#[derive(Clone)]
pub struct ShutdownHook {
    server: ServerHandle,
}

impl ShutdownHook {
    pub fn trigger(&self) {
        info!("Shutdown hook triggered");
        self.server.terminate_processing();
    }

    /// Trigger on SIGINT or SIGTERM from a dedicated thread.
    pub fn install(self) -> Result<()> {
        thread::Builder::new()
            .name("signal".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!(error = %e, "Could not start signal listener");
                        return;
                    }
                };
                match runtime.block_on(wait_for_signal()) {
                    Ok(()) => self.trigger(),
                    Err(e) => warn!(error = %e, "Signal listener failed"),
                }
            })
            .map_err(|e| ProtocolError::setup("spawn signal thread", e))?;
        Ok(())
    }
}

async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// A started server together with the pool its connections run on.
pub struct App {
    server: Server,
    pool: Arc<WorkerPool>,
    shutdown_log: PathBuf,
}

impl App {
    pub fn start(config: &Config, listener: Arc<dyn Listener>) -> Result<Self> {
        let pool = Arc::new(
            WorkerPool::new(config.workers)
                .map_err(|e| ProtocolError::setup("start worker pool", e))?,
        );
        let server = match Server::start(config, listener, Arc::clone(&pool)) {
            Ok(server) => server,
            Err(err) => {
                pool.shutdown_now();
                return Err(err);
            }
        };
        Ok(Self {
            server,
            pool,
            shutdown_log: config.shutdown_log.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn shutdown_hook(&self) -> ShutdownHook {
        ShutdownHook {
            server: self.server.handle(),
        }
    }

    /// Block until the server stops, then tear everything down.
    pub fn wait(self) -> Result<()> {
        self.server.wait();

        let mut log = ShutdownLog::open(&self.shutdown_log)
            .map_err(|e| ProtocolError::setup("open shutdown log", e));
        match log.as_mut() {
            Ok(log) => self.server.close_with_log(log),
            Err(_) => self.server.close(),
        }

        self.pool.shutdown();

        let mut log = log?;
        log.append_line("Shutdown completed successfully")
            .map_err(|e| ProtocolError::setup("write shutdown log", e))?;
        info!(path = %log.path().display(), "Shutdown recorded");
        Ok(())
    }
}

/// Run the demonstration server until a peer's shutdown request is granted
/// or the process is interrupted.
pub fn run(config: &Config) -> Result<()> {
    let app = App::start(config, Arc::new(DemoListener))?;
    app.shutdown_hook().install()?;
    info!(address = %app.local_addr(), "Waiting for connections");
    app.wait()
}
