use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Which devices a connection wants notifications for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Interest {
    #[default]
    All,
    Devices(HashSet<String>),
}

impl Interest {
    /// Parses a comma-separated device id list. An absent or blank list
    /// means every device.
    pub fn from_query(subscribe: Option<&str>) -> Self {
        let devices: HashSet<String> = subscribe
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if devices.is_empty() {
            Self::All
        } else {
            Self::Devices(devices)
        }
    }

    pub fn includes(&self, device_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Devices(set) => set.contains(device_id),
        }
    }
}

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub delivered: usize,
    /// Connections that were closed or full and have been unregistered.
    pub dropped: usize,
}

struct Connection {
    tx: mpsc::Sender<Arc<str>>,
    interest: Interest,
}

/// Registry of open connections, each owning a bounded outbound queue.
///
/// Sends never block: a connection whose queue is closed or full is
/// removed so one slow reader cannot stall the rest.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: parking_lot::Mutex<HashMap<u64, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::Sender<Arc<str>>, interest: Interest) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .insert(id, Connection { tx, interest });
        ConnectionHandle(id)
    }

    /// Removes the connection. Returns false if it was already gone.
    pub fn unregister(&self, handle: ConnectionHandle) -> bool {
        self.connections.lock().remove(&handle.0).is_some()
    }

    /// Sends `message` to every connection.
    pub fn broadcast(&self, message: Arc<str>) -> BroadcastSummary {
        self.fan_out(&message, |_| true)
    }

    /// Sends `message` to connections interested in `device_id`.
    pub fn broadcast_for(&self, device_id: &str, message: Arc<str>) -> BroadcastSummary {
        self.fan_out(&message, |interest| interest.includes(device_id))
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    fn fan_out(&self, message: &Arc<str>, wants: impl Fn(&Interest) -> bool) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        let mut connections = self.connections.lock();

        connections.retain(|id, conn| {
            if !wants(&conn.interest) {
                return true;
            }

            match conn.tx.try_send(Arc::clone(message)) {
                Ok(()) => {
                    summary.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection = *id, "outbound queue full, dropping connection");
                    summary.dropped += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection = *id, "outbound queue closed");
                    summary.dropped += 1;
                    false
                }
            }
        });

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_interest_from_query() {
        assert_eq!(Interest::from_query(None), Interest::All);
        assert_eq!(Interest::from_query(Some(" , ")), Interest::All);

        let interest = Interest::from_query(Some("pump-1, pump-2"));
        assert!(interest.includes("pump-1"));
        assert!(interest.includes("pump-2"));
        assert!(!interest.includes("pump-3"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.register(tx1, Interest::All);
        registry.register(tx2, Interest::All);

        let summary = registry.broadcast(msg("hello"));
        assert_eq!(summary.delivered, 2);
        assert_eq!(&*rx1.recv().await.expect("first receives"), "hello");
        assert_eq!(&*rx2.recv().await.expect("second receives"), "hello");
    }

    #[tokio::test]
    async fn test_broadcast_for_filters_by_interest() {
        let registry = ConnectionRegistry::new();
        let (tx_all, mut rx_all) = mpsc::channel(4);
        let (tx_one, mut rx_one) = mpsc::channel(4);
        registry.register(tx_all, Interest::All);
        registry.register(tx_one, Interest::from_query(Some("pump-1")));

        let summary = registry.broadcast_for("pump-2", msg("p2"));
        assert_eq!(summary.delivered, 1);
        registry.broadcast_for("pump-1", msg("p1"));

        assert_eq!(&*rx_all.recv().await.expect("receives p2"), "p2");
        assert_eq!(&*rx_all.recv().await.expect("receives p1"), "p1");
        assert_eq!(&*rx_one.recv().await.expect("receives p1"), "p1");
        assert!(rx_one.try_recv().is_err());
    }

    #[test]
    fn test_closed_connection_is_unregistered() {
        let registry = ConnectionRegistry::new();
        let (tx_open, _rx_open) = mpsc::channel(4);
        let (tx_closed, rx_closed) = mpsc::channel(4);
        registry.register(tx_open, Interest::All);
        registry.register(tx_closed, Interest::All);
        drop(rx_closed);

        let summary = registry.broadcast(msg("x"));
        assert_eq!(summary, BroadcastSummary { delivered: 1, dropped: 1 });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_full_queue_does_not_block_others() {
        let registry = ConnectionRegistry::new();
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        registry.register(tx_slow, Interest::All);
        registry.register(tx_fast, Interest::All);

        registry.broadcast(msg("1"));
        let summary = registry.broadcast(msg("2"));

        assert_eq!(summary.dropped, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(&*rx_fast.try_recv().expect("first"), "1");
        assert_eq!(&*rx_fast.try_recv().expect("second"), "2");
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = registry.register(tx, Interest::All);

        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.is_empty());
    }
}
