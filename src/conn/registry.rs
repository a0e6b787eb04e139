//! Registry of live connections.

use super::{ConnInfo, ConnState, Connection};
use dashmap::DashMap;
use std::sync::Arc;

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnSnapshot {
    pub info: ConnInfo,
    pub state: ConnState,
    pub protected: bool,
}

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnRegistry {
    conns: DashMap<u64, Arc<Connection>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, conn)| conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of every live connection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnSnapshot> {
        let mut snapshot: Vec<ConnSnapshot> = self
            .conns
            .iter()
            .map(|entry| {
                let record = entry.value().record();
                ConnSnapshot {
                    info: entry.value().info().clone(),
                    state: record.state,
                    protected: record.protected,
                }
            })
            .collect();
        snapshot.sort_by_key(|s| s.info.id);
        snapshot
    }

    /// Ids of connections currently counted as doing work.
    pub fn protected_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .conns
            .iter()
            .filter(|entry| entry.value().record().protected)
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::PeerAddr;

    #[test]
    fn test_insert_snapshot_remove() {
        let registry = ConnRegistry::new();
        registry.insert(Arc::new(Connection::new(2, PeerAddr::Unix)));
        registry.insert(Arc::new(Connection::new(1, PeerAddr::Unix)));
        assert_eq!(registry.len(), 2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].info.id, 1);
        assert_eq!(snapshot[1].info.id, 2);
        assert!(snapshot.iter().all(|s| s.state == ConnState::New && !s.protected));

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_protected_ids() {
        let registry = ConnRegistry::new();
        let conn = Arc::new(Connection::new(5, PeerAddr::Unix));
        conn.with_record(|record| record.protected = true);
        registry.insert(conn);
        registry.insert(Arc::new(Connection::new(6, PeerAddr::Unix)));

        assert_eq!(registry.protected_ids(), vec![5]);
    }
}
