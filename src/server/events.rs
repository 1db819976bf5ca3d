//! Timestamped notifications for whatever sits in front of the server
//! (a console, a control panel, a test).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Local};
use log::Level;
use tokio::sync::mpsc;

use crate::logger::Logger;
use crate::server::registry::ConnectionId;

/// Lifecycle state of a `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Why a client handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side (read returned zero bytes).
    PeerClosed,
    /// The server closed the connection while stopping.
    ClosedByServer,
    /// No data arrived within the configured read timeout.
    TimedOut,
    /// A read failed; carries the error text and OS code when known.
    Failed { error: String, os_code: Option<i32> },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => f.write_str("disconnected"),
            DisconnectReason::ClosedByServer => f.write_str("closed by server"),
            DisconnectReason::TimedOut => f.write_str("timed out"),
            DisconnectReason::Failed { error, os_code: Some(code) } => {
                write!(f, "read error {}: {}", code, error)
            }
            DisconnectReason::Failed { error, os_code: None } => {
                write!(f, "read error: {}", error)
            }
        }
    }
}

/// What an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Network runtime brought up or torn down (or failed to come up).
    Network,
    /// Listening socket create/bind/listen progress or failure.
    Socket,
    /// The server entered a new lifecycle state.
    Lifecycle(ServerState),
    /// A client was accepted and registered.
    Connected { id: ConnectionId, peer: SocketAddr },
    /// A client sent bytes.
    Received { id: ConnectionId, peer: SocketAddr, payload: Bytes },
    /// A client handler finished and deregistered.
    Disconnected { id: ConnectionId, peer: SocketAddr, reason: DisconnectReason },
    /// An accept call failed while the server kept running.
    AcceptFailed,
    /// `stop` (alone or inside `restart`) could not shut down cleanly.
    StopFailed,
    /// `restart` brought the server back up; the state stays Running.
    Restarted,
}

/// One notification: when it happened, what it is, and a human-readable line.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
    pub message: String,
}

impl ServerEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            message: message.into(),
        }
    }

    /// `[hh:mm:ss]: message`, the line format of the operator log panel.
    pub fn to_line(&self) -> String {
        format!("[{}]: {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Receives every event the server emits.
///
/// Called from operator threads and runtime worker threads alike, so
/// implementations must be cheap and must not block.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

impl<F> Observer for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

/// Observer that ignores everything. Logging still happens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: &ServerEvent) {}
}

/// Forwards events into an unbounded channel, for UIs that drain on their own loop.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_event(&self, event: &ServerEvent) {
        // receiver gone means nobody is watching any more
        let _ = self.tx.send(event.clone());
    }
}

/// Logs an event and hands it to the observer. Shared by the controller,
/// the accept loop and every handler.
#[derive(Clone)]
pub(crate) struct EventSink {
    observer: Arc<dyn Observer>,
    logger: Logger,
}

impl EventSink {
    pub(crate) fn new(observer: Arc<dyn Observer>, logger: Logger) -> Self {
        Self { observer, logger }
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn emit(&self, level: Level, kind: EventKind, message: impl Into<String>) {
        let event = ServerEvent::new(kind, message);
        self.logger.log(level, &event.message);
        self.observer.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_line_format() {
        let event = ServerEvent::new(EventKind::Network, "Server is started.");
        let line = event.to_line();
        // "[hh:mm:ss]: " prefix
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[9..12], "]: ");
        assert!(line.ends_with("Server is started."));
    }

    #[test]
    fn test_closure_observer_receives_emitted_events() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink = EventSink::new(
            Arc::new(move |e: &ServerEvent| sink_seen.lock().unwrap().push(e.message.clone())),
            Logger,
        );

        sink.emit(Level::Info, EventKind::Lifecycle(ServerState::Running), "running");
        sink.emit(Level::Warn, EventKind::AcceptFailed, "accept failed");

        assert_eq!(*seen.lock().unwrap(), vec!["running", "accept failed"]);
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_event(&ServerEvent::new(EventKind::Socket, "bound"));
        assert_eq!(rx.try_recv().unwrap().message, "bound");

        drop(rx);
        observer.on_event(&ServerEvent::new(EventKind::Socket, "ignored"));
    }

    #[test]
    fn test_disconnect_reason_display() {
        let reason = DisconnectReason::Failed {
            error: "connection reset".into(),
            os_code: Some(104),
        };
        assert_eq!(reason.to_string(), "read error 104: connection reset");
        assert_eq!(DisconnectReason::PeerClosed.to_string(), "disconnected");
    }
}
