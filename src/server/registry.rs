// Identifier, address and timestamp types for each entry
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

// One mutex guards the whole map; the id counter is a plain atomic
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};

// oneshot channels act as per-connection close handles
use tokio::sync::oneshot;

/// Identifies one accepted connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Public view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Local>,
}

/// Handler side of a connection's close handle.
///
/// Resolves once the registry closes the connection, either by signalling it
/// or by dropping the entry.
#[derive(Debug)]
pub struct CloseSignal(oneshot::Receiver<()>);

impl CloseSignal {
    /// Wait until the connection is closed from the server side.
    pub async fn closed(&mut self) {
        let _ = (&mut self.0).await;
    }

    /// Non-blocking check; true once the close handle fired or was dropped.
    pub fn is_closed(&mut self) -> bool {
        !matches!(self.0.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

// Registry side: holding `close_tx` keeps the connection open
struct Entry {
    peer: SocketAddr,
    connected_at: DateTime<Local>,
    close_tx: oneshot::Sender<()>,
}

/// Synchronised map of live connections, shared by the accept loop, every
/// client handler and the controller. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<ConnectionId, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A handler that panicked mid-removal must not wedge stop(); the map is
    // still consistent because every mutation is a single call.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly accepted connection and hand back its id plus the
    /// signal its handler waits on.
    pub fn insert(&self, peer: SocketAddr) -> (ConnectionId, CloseSignal) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (close_tx, close_rx) = oneshot::channel();
        let entry = Entry {
            peer,
            connected_at: Local::now(),
            close_tx,
        };
        self.lock().insert(id, entry);
        (id, CloseSignal(close_rx))
    }

    /// Deregister a connection. Removing an absent id is a no-op; returns
    /// whether anything was removed.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Close every live connection and empty the registry. Returns how many
    /// were closed.
    ///
    /// Only the controller calls this, after the accept loop has exited, so
    /// no insert can land afterwards.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            // handler may already be gone; that's fine
            let _ = entry.close_tx.send(());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Snapshot of every registered connection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                peer: entry.peer,
                connected_at: entry.connected_at,
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_insert_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let (a, _sa) = registry.insert(addr(1));
        let (b, _sb) = registry.insert(addr(2));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(a));
        assert!(registry.contains(b));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (id, _signal) = registry.insert(addr(1));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_leaves_other_entries() {
        let registry = ConnectionRegistry::new();
        let ids: Vec<ConnectionId> = (0..5).map(|i| registry.insert(addr(i)).0).collect();

        registry.remove(ids[2]);

        assert_eq!(registry.len(), 4);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(registry.contains(*id), i != 2);
        }
    }

    #[test]
    fn test_close_all_signals_every_handler() {
        let registry = ConnectionRegistry::new();
        let (_a, mut sa) = registry.insert(addr(1));
        let (_b, mut sb) = registry.insert(addr(2));
        assert!(!sa.is_closed());

        assert_eq!(registry.close_all(), 2);

        assert!(registry.is_empty());
        assert!(sa.is_closed());
        assert!(sb.is_closed());
    }

    #[test]
    fn test_remove_drops_close_handle() {
        let registry = ConnectionRegistry::new();
        let (id, mut signal) = registry.insert(addr(1));
        registry.remove(id);
        assert!(signal.is_closed());
    }

    #[test]
    fn test_close_all_on_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = ConnectionRegistry::new();
        let (a, _sa) = registry.insert(addr(10));
        let (b, _sb) = registry.insert(addr(20));
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].id, a);
        assert_eq!(snap[1].id, b);
        assert_eq!(snap[1].peer, addr(20));
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..100u16 {
                        let (id, _signal) = registry.insert(addr(t * 100 + i));
                        if i % 2 == 0 {
                            assert!(registry.remove(id));
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 50);
    }
}
