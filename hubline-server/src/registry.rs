//! Live connection registry.
//!
//! Tracks which identities hold live connections (possibly several devices
//! each) and which connections are anonymous visitors. Every connection is in
//! exactly one of the two places, and an identity is present only while it
//! has at least one connection.
//!
//! Buckets are sharded by `DashMap`, so operations on different identities
//! do not contend. Emptiness is re-checked under the shard lock on removal,
//! so a removal racing an add for the same identity never drops the add.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hubline_sdk::protocol::{ConnectionId, ConnectionSummary, Identity};
use tokio::sync::mpsc;

/// Display fields captured from the credential at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// One live transport session and its outbound push queue.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub identity: Option<Identity>,
    pub metadata: ConnectionMetadata,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Arc<String>>,
    presence_interest: AtomicBool,
    dropped: AtomicU64,
}

impl ClientConnection {
    /// Queue an encoded frame without waiting. A full queue drops the frame
    /// for this connection only; returns whether it was queued.
    pub fn push(&self, frame: Arc<String>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(conn_id = %self.id, dropped, "outbound queue full, dropping push");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(conn_id = %self.id, "push to closed connection");
                false
            }
        }
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            connection_id: self.id.clone(),
            name: self.metadata.name.clone(),
            email: self.metadata.email.clone(),
            connected_at: self.connected_at,
        }
    }

    pub fn wants_presence(&self) -> bool {
        self.presence_interest.load(Ordering::Relaxed)
    }

    pub fn set_presence_interest(&self, enabled: bool) {
        self.presence_interest.store(enabled, Ordering::Relaxed);
    }

    /// Pushes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct ConnectionRegistry {
    users: DashMap<Identity, Vec<Arc<ClientConnection>>>,
    visitors: DashMap<ConnectionId, Arc<ClientConnection>>,
    /// connection id -> owning identity (None for visitors), for removal by id.
    owners: DashMap<ConnectionId, Option<Identity>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            visitors: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register a connection under `identity`, or as a visitor when there is
    /// none. Never fails. Re-registering an id replaces the old entry.
    pub fn add_connection(
        &self,
        identity: Option<Identity>,
        id: ConnectionId,
        metadata: ConnectionMetadata,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Arc<ClientConnection> {
        if self.owners.contains_key(&id) {
            tracing::warn!(conn_id = %id, "connection id registered twice, replacing");
            self.remove_connection(&id);
        }

        let conn = Arc::new(ClientConnection {
            id: id.clone(),
            identity: identity.clone(),
            metadata,
            connected_at: Utc::now(),
            tx,
            presence_interest: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        });

        match &identity {
            Some(identity) => self
                .users
                .entry(identity.clone())
                .or_default()
                .push(Arc::clone(&conn)),
            None => {
                self.visitors.insert(id.clone(), Arc::clone(&conn));
            }
        }
        self.owners.insert(id, identity);
        conn
    }

    /// Remove a connection from whichever set holds it. An identity whose
    /// last connection goes away leaves the roster.
    pub fn remove_connection(&self, id: &str) -> Option<Arc<ClientConnection>> {
        let (_, owner) = self.owners.remove(id)?;
        match owner {
            None => self.visitors.remove(id).map(|(_, conn)| conn),
            Some(identity) => {
                let removed = {
                    let mut bucket = self.users.get_mut(&identity)?;
                    let pos = bucket.iter().position(|c| c.id == id)?;
                    bucket.swap_remove(pos)
                };
                self.users.remove_if(&identity, |_, conns| conns.is_empty());
                Some(removed)
            }
        }
    }

    /// Snapshot of online identities and their connections.
    ///
    /// Not lock-free: the walk takes each shard's read lock in turn, so it
    /// can briefly wait on a concurrent add or remove in the same shard and
    /// may miss changes to shards already visited.
    pub fn online_roster(&self) -> BTreeMap<Identity, Vec<ConnectionSummary>> {
        self.users
            .iter()
            .map(|entry| {
                let mut clients: Vec<_> = entry.value().iter().map(|c| c.summary()).collect();
                clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
                (entry.key().clone(), clients)
            })
            .collect()
    }

    /// Sums shard lengths under short read locks, like [`Self::online_roster`].
    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    /// Connection ids for an identity; empty when offline.
    pub fn connections_by_identity(&self, identity: &Identity) -> Vec<ConnectionId> {
        self.users
            .get(identity)
            .map(|conns| conns.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Push targets for an identity; empty when offline.
    pub fn connections_for(&self, identity: &Identity) -> Vec<Arc<ClientConnection>> {
        self.users
            .get(identity)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn all_connections(&self) -> Vec<Arc<ClientConnection>> {
        let mut all: Vec<_> = self
            .users
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.extend(self.visitors.iter().map(|entry| Arc::clone(entry.value())));
        all
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.users.contains_key(identity)
    }

    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Drop every entry. Connection tasks still hold their own handles and
    /// are stopped separately.
    pub fn shutdown(&self) {
        let count = self.owners.len();
        self.users.clear();
        self.visitors.clear();
        self.owners.clear();
        tracing::info!(count, "connection registry cleared");
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(8).0
    }

    fn add(registry: &ConnectionRegistry, identity: Option<&str>, id: &str) -> Arc<ClientConnection> {
        registry.add_connection(
            identity.map(Identity::new),
            id.to_string(),
            ConnectionMetadata::default(),
            sender(),
        )
    }

    #[test]
    fn visitor_count_tracks_anonymous_connections_under_random_interleaving() {
        let registry = ConnectionRegistry::new();
        let mut rng = rand::thread_rng();
        let mut live: Vec<(String, bool)> = Vec::new();

        for n in 0..2_000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let anonymous = rng.gen_bool(0.5);
                let id = format!("c{n}");
                let identity = format!("user{}", rng.gen_range(0..5));
                add(&registry, (!anonymous).then_some(identity.as_str()), &id);
                live.push((id, anonymous));
            } else {
                let (id, _) = live.swap_remove(rng.gen_range(0..live.len()));
                registry.remove_connection(&id);
            }
            let expected = live.iter().filter(|(_, anonymous)| *anonymous).count();
            assert_eq!(registry.visitor_count(), expected);
            assert_eq!(registry.connection_count(), live.len());
        }
    }

    #[test]
    fn last_connection_removal_takes_identity_offline() {
        let registry = ConnectionRegistry::new();
        add(&registry, Some("alice"), "c1");
        assert!(registry.online_roster().contains_key(&Identity::new("alice")));

        registry.remove_connection("c1");

        assert!(registry.online_roster().is_empty());
        assert!(!registry.is_online(&Identity::new("alice")));
        assert!(registry.connections_by_identity(&Identity::new("alice")).is_empty());
    }

    #[test]
    fn two_devices_both_listed_and_one_survives_removal() {
        let registry = ConnectionRegistry::new();
        add(&registry, Some("alice"), "phone");
        add(&registry, Some("alice"), "laptop");

        let roster = registry.online_roster();
        assert_eq!(roster[&Identity::new("alice")].len(), 2);

        registry.remove_connection("phone");

        let roster = registry.online_roster();
        let clients = &roster[&Identity::new("alice")];
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].connection_id, "laptop");
    }

    #[test]
    fn visitors_are_not_in_roster() {
        let registry = ConnectionRegistry::new();
        add(&registry, None, "v1");
        add(&registry, Some("bob"), "c1");

        assert_eq!(registry.visitor_count(), 1);
        assert_eq!(registry.online_roster().len(), 1);
        assert_eq!(registry.all_connections().len(), 2);

        assert!(registry.remove_connection("v1").is_some());
        assert_eq!(registry.visitor_count(), 0);
    }

    #[test]
    fn removing_unknown_connection_is_a_noop() {
        let registry = ConnectionRegistry::new();
        add(&registry, Some("alice"), "c1");
        assert!(registry.remove_connection("nope").is_none());
        assert!(registry.remove_connection("c1").is_some());
        assert!(registry.remove_connection("c1").is_none());
    }

    #[test]
    fn duplicate_id_replaces_previous_registration() {
        let registry = ConnectionRegistry::new();
        add(&registry, None, "c1");
        add(&registry, Some("alice"), "c1");

        assert_eq!(registry.visitor_count(), 0);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connections_by_identity(&Identity::new("alice")), ["c1"]);
    }

    #[test]
    fn hundred_concurrent_adds_under_one_identity() {
        let registry = ConnectionRegistry::new();
        std::thread::scope(|s| {
            for i in 0..100 {
                let registry = &registry;
                s.spawn(move || {
                    add(registry, Some("alice"), &format!("c{i}"));
                });
            }
        });

        assert_eq!(registry.connections_by_identity(&Identity::new("alice")).len(), 100);
        assert_eq!(registry.online_roster()[&Identity::new("alice")].len(), 100);
    }

    #[test]
    fn concurrent_add_and_remove_for_one_identity_lose_nothing() {
        let registry = ConnectionRegistry::new();
        for round in 0..200 {
            add(&registry, Some("alice"), &format!("old{round}"));
            std::thread::scope(|s| {
                let r = &registry;
                s.spawn(move || {
                    r.remove_connection(&format!("old{round}"));
                });
                s.spawn(move || {
                    add(r, Some("alice"), &format!("new{round}"));
                });
            });
            let ids = registry.connections_by_identity(&Identity::new("alice"));
            assert_eq!(ids, [format!("new{round}")], "round {round}");
            registry.remove_connection(&format!("new{round}"));
            assert!(!registry.is_online(&Identity::new("alice")));
        }
    }

    #[test]
    fn full_queue_drops_push_for_that_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = registry.add_connection(None, "v".into(), ConnectionMetadata::default(), tx);

        assert!(conn.push(Arc::new("one".into())));
        assert!(!conn.push(Arc::new("two".into())));
        assert_eq!(conn.dropped(), 1);
    }

    #[test]
    fn shutdown_clears_everything() {
        let registry = ConnectionRegistry::new();
        add(&registry, Some("alice"), "c1");
        add(&registry, None, "v1");
        registry.shutdown();
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.visitor_count(), 0);
        assert!(registry.online_roster().is_empty());
    }
}
