use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use log::Level;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::server::events::{DisconnectReason, EventKind, EventSink};
use crate::server::registry::{CloseSignal, ConnectionId, ConnectionRegistry};

/// Everything a client session needs besides its stream.
pub(crate) struct Session {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub close: CloseSignal,
    pub registry: ConnectionRegistry,
    pub events: EventSink,
    pub read_buffer_size: usize,
    pub read_timeout: Option<Duration>,
}

/// Manages a single client's session:
/// - Reads into a fixed-size buffer and logs whatever arrives
/// - Stops on EOF, read error, idle timeout, or the registry closing it
/// - On exit, removes the client from the registry and reports why
pub(crate) async fn handle_client(mut stream: TcpStream, mut session: Session) {
    let reason = read_until_closed(&mut stream, &mut session).await;

    // Dropping the stream closes our side of the socket
    drop(stream);

    // The registry may already have dropped us during stop(); remove is idempotent
    session.registry.remove(session.id);
    let remaining = session.registry.len();

    let level = match reason {
        DisconnectReason::Failed { .. } | DisconnectReason::TimedOut => Level::Warn,
        _ => Level::Info,
    };
    let message = format!(
        "Client {} ({}) {}. Active connections: {}",
        session.id, session.peer, reason, remaining
    );
    session.events.emit(
        level,
        EventKind::Disconnected {
            id: session.id,
            peer: session.peer,
            reason,
        },
        message,
    );
}

// Main loop: whichever comes first, data or the registry closing us
async fn read_until_closed(stream: &mut TcpStream, session: &mut Session) -> DisconnectReason {
    let mut buffer = vec![0u8; session.read_buffer_size];

    loop {
        tokio::select! {
            _ = session.close.closed() => {
                return DisconnectReason::ClosedByServer;
            }

            result = read_with_timeout(stream, &mut buffer, session.read_timeout) => {
                match result {
                    Ok(0) => return DisconnectReason::PeerClosed,
                    Ok(n) => log_received(session, &buffer[..n]),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        return DisconnectReason::TimedOut;
                    }
                    Err(e) => {
                        return DisconnectReason::Failed {
                            error: e.to_string(),
                            os_code: e.raw_os_error(),
                        };
                    }
                }
            }
        }
    }
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buffer: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    match timeout {
        None => stream.read(buffer).await,
        Some(limit) => match tokio::time::timeout(limit, stream.read(buffer)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data for {:?}", limit),
            )),
        },
    }
}

fn log_received(session: &Session, data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    let message = format!(
        "Received from client {} ({}): {}",
        session.id,
        session.peer,
        trim_line_ending(&text)
    );
    session.events.emit(
        Level::Info,
        EventKind::Received {
            id: session.id,
            peer: session.peer,
            payload: Bytes::copy_from_slice(data),
        },
        message,
    );
}

/// Strips one trailing `\n` or `\r\n` so log lines don't double up.
fn trim_line_ending(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending("ping\n"), "ping");
        assert_eq!(trim_line_ending("ping\r\n"), "ping");
        assert_eq!(trim_line_ending("ping"), "ping");
        assert_eq!(trim_line_ending("a\n\n"), "a\n");
    }
}
