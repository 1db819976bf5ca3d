use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::Level;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::server::events::{EventKind, EventSink};
use crate::server::handler::{Session, handle_client};
use crate::server::registry::ConnectionRegistry;

/// State the accept loop shares with the controller for one Running period.
pub(crate) struct AcceptContext {
    pub running: Arc<AtomicBool>,
    pub registry: ConnectionRegistry,
    pub events: EventSink,
    pub read_buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub accept_error_backoff: Duration,
}

/// Listens for new clients and spawns a session task for each.
///
/// Exits when the running flag is cleared or the controller drops
/// `listener_close`, then drops the listener and hands back the set of
/// handler tasks so the controller can join them.
pub(crate) async fn accept_connections(
    listener: TcpListener,
    mut listener_close: oneshot::Receiver<()>,
    ctx: AcceptContext,
) -> JoinSet<()> {
    let mut handlers: JoinSet<()> = JoinSet::new();
    let logger = *ctx.events.logger();

    logger.info("Started listening for clients.");

    loop {
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            // 1) Controller closed the listening socket
            _ = &mut listener_close => {
                if ctx.running.load(Ordering::SeqCst) {
                    logger.warn("Listening socket closed while the server is still running.");
                }
                break;
            }

            // 2) New client arrives
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => admit(stream, peer, &ctx, &mut handlers),
                    Err(e) => {
                        if !on_accept_error(&ctx, &e) {
                            break;
                        }
                        // e.g. too many open files; give the system a moment
                        tokio::time::sleep(ctx.accept_error_backoff).await;
                    }
                }
            }

            // 3) Reap finished sessions so the set doesn't grow without bound
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        logger.error(&format!("Client handler panicked: {}", e));
                    }
                }
            }
        }
    }

    drop(listener);
    logger.info(&format!(
        "Closed session listening for new clients; {} handler(s) still active.",
        handlers.len()
    ));
    handlers
}

/// Reports a failed accept. Returns false when the server is no longer
/// running and the loop should exit without reporting.
pub(crate) fn on_accept_error(ctx: &AcceptContext, e: &io::Error) -> bool {
    if !ctx.running.load(Ordering::SeqCst) {
        return false;
    }
    let code = e
        .raw_os_error()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "n/a".into());
    ctx.events.emit(
        Level::Warn,
        EventKind::AcceptFailed,
        format!("Failed to accept client connection (os error {}): {}", code, e),
    );
    true
}

fn admit(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    ctx: &AcceptContext,
    handlers: &mut JoinSet<()>,
) {
    // Register before spawning so stop() can always reach the new session
    let (id, close) = ctx.registry.insert(peer);
    let active = ctx.registry.len();
    ctx.events.emit(
        Level::Info,
        EventKind::Connected { id, peer },
        format!("New client connection {} from {}. Active connections: {}", id, peer, active),
    );

    let session = Session {
        id,
        peer,
        close,
        registry: ctx.registry.clone(),
        events: ctx.events.clone(),
        read_buffer_size: ctx.read_buffer_size,
        read_timeout: ctx.read_timeout,
    };
    handlers.spawn(handle_client(stream, session));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::server::events::ServerEvent;
    use std::sync::Mutex;

    fn context(running: bool) -> (AcceptContext, Arc<Mutex<Vec<ServerEvent>>>) {
        let seen: Arc<Mutex<Vec<ServerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let events = EventSink::new(
            Arc::new(move |e: &ServerEvent| sink_seen.lock().unwrap().push(e.clone())),
            Logger,
        );
        let ctx = AcceptContext {
            running: Arc::new(AtomicBool::new(running)),
            registry: ConnectionRegistry::new(),
            events,
            read_buffer_size: 16,
            read_timeout: None,
            accept_error_backoff: Duration::from_millis(1),
        };
        (ctx, seen)
    }

    #[test]
    fn test_accept_error_while_running_is_reported_and_loop_continues() {
        let (ctx, seen) = context(true);
        // EMFILE
        let err = io::Error::from_raw_os_error(24);

        assert!(on_accept_error(&ctx, &err));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::AcceptFailed);
        assert!(seen[0].message.contains("os error 24"));
    }

    #[test]
    fn test_accept_error_without_os_code() {
        let (ctx, seen) = context(true);
        let err = io::Error::other("synthetic");

        assert!(on_accept_error(&ctx, &err));
        assert!(seen.lock().unwrap()[0].message.contains("os error n/a"));
    }

    #[test]
    fn test_accept_error_after_stop_exits_silently() {
        let (ctx, seen) = context(false);
        let err = io::Error::from_raw_os_error(24);

        assert!(!on_accept_error(&ctx, &err));
        assert!(seen.lock().unwrap().is_empty());
    }
}
