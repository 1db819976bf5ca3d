/// === IMPORTS ===

// Standard library type for holding an IP address and port together.
use std::net::SocketAddr;

// Shared ownership, the running flag, and the two controller locks.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use std::io;

// Tokio's runtime (our "network stack"), raw sockets for staged setup,
// and the task handles we join on stop.
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use log::Level;


/// === MODULES ===

pub mod events;
pub mod registry;

mod accept;
mod handler;


use crate::config::ServerConfig;
use crate::error::{SetupStage, StartError, StopError};
use crate::logger::Logger;

use accept::{AcceptContext, accept_connections};
use events::{EventKind, EventSink, NullObserver, Observer, ServerState};
use registry::{ConnectionInfo, ConnectionRegistry};


/// === TYPES ===

// What the queries read; written only by the controller.
struct Status {
    state: ServerState,
    port: u16,
    local_addr: Option<SocketAddr>,
}

// Held for the whole of start/stop/restart so lifecycle calls never interleave.
struct Lifecycle {
    port: u16,
    active: Option<ActiveServer>,
}

// Everything that exists only while Running.
struct ActiveServer {
    runtime: Runtime,
    // Dropping this closes the listening socket owned by the accept loop.
    listener_close: oneshot::Sender<()>,
    accept_task: JoinHandle<JoinSet<()>>,
    local_addr: SocketAddr,
}

/// A TCP server that can be started, stopped and restarted from outside.
///
/// The lifecycle methods block the calling thread and must be called from
/// outside any async runtime (an operator thread, a console, a test). The
/// server owns its own multi-threaded Tokio runtime for each Running period.
///
/// ```no_run
/// use rust_tokio_server::{Server, ServerConfig};
///
/// let server = Server::new(ServerConfig::default());
/// server.start(12345)?;
/// // ... clients connect, their bytes get logged ...
/// server.stop()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Server {
    config: ServerConfig,
    events: EventSink,
    registry: ConnectionRegistry,
    running: Arc<AtomicBool>,
    status: Mutex<Status>,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    /// A stopped server whose events only go to the log.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_observer(config, NullObserver)
    }

    /// A stopped server that also reports every event to `observer`.
    pub fn with_observer(config: ServerConfig, observer: impl Observer + 'static) -> Self {
        let config = config.normalized();
        let port = config.port;
        Self {
            config,
            events: EventSink::new(Arc::new(observer), Logger),
            registry: ConnectionRegistry::new(),
            running: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(Status {
                state: ServerState::Stopped,
                port,
                local_addr: None,
            }),
            lifecycle: Mutex::new(Lifecycle { port, active: None }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lock_status().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Port of the most recent `start` (what `restart` will reuse).
    pub fn port(&self) -> u16 {
        self.lock_status().port
    }

    /// Address actually bound while Running; resolves port 0 to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_status().local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    /// Bind `host:port`, start accepting, and return without waiting.
    ///
    /// Fails with `AlreadyRunning` if the server is not Stopped, leaving
    /// everything as it was. Any other failure releases whatever was set up
    /// and leaves the server Stopped.
    pub fn start(&self, port: u16) -> Result<(), StartError> {
        let mut lifecycle = self.lock_lifecycle();
        self.start_locked(&mut lifecycle, port)
    }

    /// Stop accepting, close every client, and wait until no task remains.
    ///
    /// Stopping a stopped server is a no-op. Called from inside an async
    /// runtime it returns `InsideRuntime` and changes nothing; otherwise the
    /// server is Stopped when this returns, even if an error is reported.
    pub fn stop(&self) -> Result<(), StopError> {
        if inside_runtime() {
            self.events.emit(
                Level::Error,
                EventKind::StopFailed,
                "Stop refused: called from inside an async runtime.",
            );
            return Err(StopError::InsideRuntime);
        }
        let mut lifecycle = self.lock_lifecycle();
        self.stop_locked(&mut lifecycle)
    }

    /// `stop` followed by `start` on the port of the last `start`.
    ///
    /// A failed stop is reported and the start is attempted anyway; only the
    /// start result is returned. From inside an async runtime nothing is
    /// touched and `Initialization` is returned, as `start` would.
    pub fn restart(&self) -> Result<(), StartError> {
        if inside_runtime() {
            let e = runtime_context_error();
            self.events.emit(
                Level::Error,
                EventKind::StopFailed,
                format!("Restart refused: {}.", e),
            );
            return Err(StartError::Initialization(e));
        }
        let mut lifecycle = self.lock_lifecycle();

        if let Err(e) = self.stop_locked(&mut lifecycle) {
            self.events.emit(
                Level::Warn,
                EventKind::StopFailed,
                format!("Stop during restart failed: {}; starting anyway.", e),
            );
        }

        let port = lifecycle.port;
        self.start_locked(&mut lifecycle, port)?;
        self.events.emit(Level::Info, EventKind::Restarted, "Server is restarted.");
        Ok(())
    }


    /// === START ===

    fn start_locked(&self, lifecycle: &mut Lifecycle, port: u16) -> Result<(), StartError> {
        if lifecycle.active.is_some() || self.state() != ServerState::Stopped {
            self.events.logger().warn(&format!(
                "Start on port {} refused: server is already {}.",
                port,
                self.state()
            ));
            return Err(StartError::AlreadyRunning);
        }

        lifecycle.port = port;
        self.lock_status().port = port;
        self.set_state(ServerState::Starting);

        // 1) Bring up the runtime that drives every socket of this Running period
        let runtime = match self.build_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.events.emit(
                    Level::Error,
                    EventKind::Network,
                    format!("Failed to initialize network runtime: {}", e),
                );
                self.set_state(ServerState::Stopped);
                return Err(StartError::Initialization(e));
            }
        };
        self.events.emit(
            Level::Info,
            EventKind::Network,
            "Successfully initialized network runtime.",
        );

        // 2) Create, bind and listen; a failure at any step drops what exists so far
        let (listener, local_addr) = match self.open_listener(&runtime, port) {
            Ok(bound) => bound,
            Err(e) => {
                drop(runtime);
                self.events.emit(Level::Info, EventKind::Network, "Network runtime released.");
                self.set_state(ServerState::Stopped);
                return Err(e);
            }
        };

        // 3) Hand the listener to the accept loop
        self.running.store(true, Ordering::SeqCst);
        let (listener_close, close_rx) = oneshot::channel();
        let ctx = AcceptContext {
            running: self.running.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            read_buffer_size: self.config.read_buffer_size,
            read_timeout: self.config.read_timeout(),
            accept_error_backoff: self.config.accept_error_backoff(),
        };
        let accept_task = runtime.spawn(accept_connections(listener, close_rx, ctx));

        lifecycle.active = Some(ActiveServer {
            runtime,
            listener_close,
            accept_task,
            local_addr,
        });
        self.lock_status().local_addr = Some(local_addr);
        self.set_state(ServerState::Running);
        Ok(())
    }

    fn build_runtime(&self) -> io::Result<Runtime> {
        // block_on inside another runtime would panic in stop(); refuse up front
        if inside_runtime() {
            return Err(runtime_context_error());
        }

        Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name("rust-server-worker")
            .enable_all()
            .build()
    }

    fn open_listener(
        &self,
        runtime: &Runtime,
        port: u16,
    ) -> Result<(TcpListener, SocketAddr), StartError> {
        // listen() registers with the reactor of the current runtime
        let _guard = runtime.enter();

        let addr = self.config.bind_addr(port).map_err(|e| {
            self.setup_failed(SetupStage::Create, format!("{}:{}", self.config.host, port), e)
        })?;

        let created = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = created.map_err(|e| self.setup_failed(SetupStage::Create, addr.to_string(), e))?;
        self.events.emit(Level::Info, EventKind::Socket, "Successfully created socket.");

        // Same default tokio's TcpListener::bind applies on unix
        if cfg!(unix) {
            if let Err(e) = socket.set_reuseaddr(true) {
                self.events
                    .logger()
                    .warn(&format!("Failed to set SO_REUSEADDR on {}: {}", addr, e));
            }
        }

        socket
            .bind(addr)
            .map_err(|e| self.setup_failed(SetupStage::Bind, addr.to_string(), e))?;
        self.events.emit(
            Level::Info,
            EventKind::Socket,
            format!("Successfully bound socket to {}.", addr),
        );

        let listener = socket
            .listen(self.config.backlog)
            .map_err(|e| self.setup_failed(SetupStage::Listen, addr.to_string(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| self.setup_failed(SetupStage::Listen, addr.to_string(), e))?;
        self.events.emit(
            Level::Info,
            EventKind::Socket,
            format!("Successfully listening on {}.", local_addr),
        );

        Ok((listener, local_addr))
    }

    // Log with the OS code before the caller releases anything.
    fn setup_failed(&self, stage: SetupStage, addr: String, source: io::Error) -> StartError {
        let code = source
            .raw_os_error()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "n/a".into());
        self.events.emit(
            Level::Error,
            EventKind::Socket,
            format!("Failed to {} socket for {} (os error {}): {}", stage, addr, code, source),
        );
        StartError::SocketSetup { stage, addr, source }
    }


    /// === STOP ===

    fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), StopError> {
        let Some(active) = lifecycle.active.take() else {
            self.events.logger().debug("Stop requested but server is already stopped.");
            return Ok(());
        };
        let ActiveServer {
            runtime,
            listener_close,
            accept_task,
            local_addr,
        } = active;

        self.set_state(ServerState::Stopping);

        // 1) Tell the accept loop to quit, then close its socket so accept() returns
        self.running.store(false, Ordering::SeqCst);
        drop(listener_close);
        self.events.emit(
            Level::Info,
            EventKind::Socket,
            format!("Closed listening socket on {}.", local_addr),
        );

        // 2) Wait for the accept loop; after this nothing inserts into the registry
        let mut failure = None;
        let handlers = match runtime.block_on(accept_task) {
            Ok(handlers) => Some(handlers),
            Err(e) => {
                self.events.emit(
                    Level::Error,
                    EventKind::StopFailed,
                    format!("Accept loop terminated abnormally: {}", e),
                );
                failure = Some(StopError::AcceptLoop(e));
                None
            }
        };

        // 3) Close every client; their blocked reads return and they exit
        let closed = self.registry.close_all();
        if closed > 0 {
            self.events
                .logger()
                .info(&format!("Closed {} client connection(s).", closed));
        }

        // 4) Join every handler so none outlives stop()
        if let Some(mut handlers) = handlers {
            let logger = *self.events.logger();
            runtime.block_on(async move {
                while let Some(finished) = handlers.join_next().await {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            logger.error(&format!("Client handler panicked: {}", e));
                        }
                    }
                }
            });
        }

        // 5) Tear down the runtime; anything left (after a panic) is cancelled here
        drop(runtime);
        self.events.emit(Level::Info, EventKind::Network, "Network runtime released.");

        self.lock_status().local_addr = None;
        self.set_state(ServerState::Stopped);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }


    /// === HELPERS ===

    fn set_state(&self, state: ServerState) {
        self.lock_status().state = state;

        let message = match state {
            ServerState::Starting => "Server is starting.",
            ServerState::Running => "Server is started.",
            ServerState::Stopping => "Server is stopping.",
            ServerState::Stopped => "Server is stopped.",
        };
        self.events.emit(Level::Info, EventKind::Lifecycle(state), message);
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn inside_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

fn runtime_context_error() -> io::Error {
    io::Error::other("lifecycle calls must be made from outside an async runtime")
}

impl Drop for Server {
    fn drop(&mut self) {
        let in_runtime = inside_runtime();
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.active.is_none() {
            return;
        }

        if !in_runtime {
            if let Err(e) = self.stop_locked(&mut lifecycle) {
                self.events.logger().warn(&format!("Stop on drop failed: {}", e));
            }
            return;
        }

        // Can't block here; cancel everything and let the runtime unwind in the background
        if let Some(active) = lifecycle.active.take() {
            self.running.store(false, Ordering::SeqCst);
            drop(active.listener_close);
            self.registry.close_all();
            active.runtime.shutdown_background();
            self.events
                .logger()
                .warn("Server dropped inside an async runtime; tasks cancelled without joining.");
        }
    }
}
