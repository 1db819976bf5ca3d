//! A TCP connection server with an externally driven start/stop/restart
//! lifecycle.
//!
//! The server binds a port, accepts connections, runs one handler task per
//! client (bytes are read and logged, never answered), and reports every
//! lifecycle step, connection and disconnect to an [`Observer`].
//! [`Server::stop`] returns only once the accept loop and every client
//! handler have finished.

// Parsing and defaults for the JSON configuration file.
pub mod config;

// Error types surfaced by the lifecycle API.
pub mod error;

// Logging utilities for lifecycle events and client traffic.
pub mod logger;

// The controller, accept loop, client handlers and connection registry.
pub mod server;

pub use config::{DEFAULT_PORT, LoggerConfig, ServerConfig};
pub use error::{ConfigError, SetupStage, StartError, StopError};
pub use logger::{Logger, init_logger};
pub use server::Server;
pub use server::events::{
    ChannelObserver, DisconnectReason, EventKind, NullObserver, Observer, ServerEvent,
    ServerState,
};
pub use server::registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
