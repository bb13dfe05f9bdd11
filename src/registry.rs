use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::{Connection, ConnectionId};

/// Live connections keyed by identity. A connection is present only while it
/// is `Active`; all access goes through these methods.
#[derive(Clone, Default)]
pub struct Registry {
    conns: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Activates and inserts `conn`. No-op returning `false` if the identity is
    /// taken or the connection is already closing.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        match self.conns.entry(conn.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if !conn.activate() {
                    return false;
                }
                slot.insert(conn);
                true
            }
        }
    }

    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|guard| guard.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.conns.contains_key(&id)
    }

    /// Point-in-time copy of the active connections. Callers do their slow work
    /// on the copy, never under the map's locks.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Names of active connections ordered by identity.
    pub fn roster(&self) -> Vec<(ConnectionId, String)> {
        let mut names: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|c| (c.id(), c.name().to_string()))
            .collect();
        names.sort_by_key(|(id, _)| *id);
        names
    }

    /// Active connections only, consistent with `snapshot` and `roster`.
    pub fn active_len(&self) -> usize {
        self.conns.iter().filter(|e| e.value().is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CloseReason, ConnState, test_conn};
    use std::collections::HashSet;

    #[test]
    fn register_is_noop_for_duplicate_identity() {
        let registry = Registry::default();
        let (first, _rx1) = test_conn(1, "alice", 4);
        let (dup, _rx2) = test_conn(1, "mallory", 4);

        assert!(registry.register(first.clone()));
        assert!(!registry.register(dup.clone()));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first.id()).unwrap().name(), "alice");
        assert_eq!(dup.state(), ConnState::Connecting);
        assert!(first.is_active());
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = Registry::default();
        let (conn, _rx) = test_conn(1, "alice", 4);
        registry.register(conn.clone());

        assert!(registry.deregister(conn.id()).is_some());
        assert!(registry.deregister(conn.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn closing_connection_is_not_registered_or_snapshotted() {
        let registry = Registry::default();
        let (late, _rx1) = test_conn(1, "late", 4);
        late.close(CloseReason::Shutdown);
        assert!(!registry.register(late));
        assert!(registry.is_empty());

        let (conn, _rx2) = test_conn(2, "alice", 4);
        registry.register(conn.clone());
        conn.close(CloseReason::Quit);

        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn active_len_skips_closing_entries() {
        let registry = Registry::default();
        let (alice, _rx1) = test_conn(1, "alice", 4);
        let (bob, _rx2) = test_conn(2, "bob", 4);
        registry.register(alice.clone());
        registry.register(bob.clone());

        // closed but not yet deregistered
        bob.close(CloseReason::PeerClosed);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_len(), 1);
        assert_eq!(registry.active_len(), registry.roster().len());
    }

    #[test]
    fn ids_are_never_reused() {
        let registry = Registry::default();
        let ids: HashSet<_> = (0..1000).map(|_| registry.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn roster_is_sorted_by_identity() {
        let registry = Registry::default();
        let (b, _rx1) = test_conn(2, "bob", 4);
        let (a, _rx2) = test_conn(1, "alice", 4);
        registry.register(b);
        registry.register(a);

        let names: Vec<_> = registry.roster().into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let registry = Registry::default();
        let mut tasks = Vec::new();

        for worker in 0..8u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for i in 0..100u64 {
                    let raw = worker * 1000 + i;
                    let (conn, rx) = test_conn(raw, "user", 1);
                    assert!(registry.register(conn));
                    // drop every other one again
                    if i % 2 == 0 {
                        assert!(registry.deregister(ConnectionId::new(raw)).is_some());
                    } else {
                        kept.push((ConnectionId::new(raw), rx));
                    }
                }
                kept.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
            }));
        }

        let mut expected = HashSet::new();
        for task in tasks {
            expected.extend(task.await.unwrap());
        }

        let seen: HashSet<_> = registry.snapshot().iter().map(|c| c.id()).collect();
        assert_eq!(seen, expected);
        assert_eq!(registry.len(), 400);
    }
}
