//! `NetworkManager`: owns the local identity, the peer catalog, the set of
//! live sessions, and the auto-connect loop (§4.4).
//!
//! Grounded on the teacher's top-level connection manager that owns
//! `outgoingPeers`/`incomingPeers` maps and drives reconnection; the
//! recent-keys window and `expressSync` fan-out are this crate's additions
//! layered on that same owning-task shape.

use crate::net::address::Address;
use crate::net::config::NetConfig;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::message::NetworkMessage;
use crate::net::peer_db::{PeerDb, PeerDbConfig};
use crate::net::store::CubeStore;
use crate::net::transport::Connection;
use crate::net::types::{CubeKey, NodeIdentity, now};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Bounded FIFO of recently-seen cube keys, used to avoid re-announcing a
/// key to a peer that just told us about it (§4.4).
pub struct RecentKeysWindow {
    keys: VecDeque<CubeKey>,
    capacity: usize,
}

impl RecentKeysWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, key: CubeKey) {
        if self.keys.contains(&key) {
            return;
        }
        if self.keys.len() >= self.capacity {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
    }

    pub fn contains(&self, key: &CubeKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A live outgoing or incoming session slot.
struct Session {
    address: Address,
    is_outgoing: bool,
}

/// Owns all network-layer state for one node. Intended to run inside a
/// single actor task; all mutation happens through `&mut self` methods, and
/// any cross-task access goes through channels rather than shared locks,
/// except where the store itself requires `Arc` sharing (`CubeStore`).
pub struct NetworkManager {
    pub local_identity: NodeIdentity,
    config: NetConfig,
    peer_db: PeerDb,
    sessions: HashMap<NodeIdentity, Session>,
    recent_keys: RecentKeysWindow,
    store: Arc<dyn CubeStore>,
}

pub struct NetworkManagerStats {
    pub online_peers: usize,
    pub outgoing_peers: usize,
    pub incoming_peers: usize,
    pub known_peers: usize,
    pub recent_keys: usize,
}

impl NetworkManager {
    pub fn new(config: NetConfig, store: Arc<dyn CubeStore>) -> Self {
        let recent_keys = RecentKeysWindow::new(config.recent_key_window_size);
        let peer_db_config = PeerDbConfig {
            bad_peer_rehabilitation_chance: config.bad_peer_rehabilitation_chance,
            reconnect_interval_secs: config.reconnect_interval.as_secs(),
        };
        Self {
            local_identity: NodeIdentity::random(),
            config,
            peer_db: PeerDb::new(peer_db_config),
            sessions: HashMap::new(),
            recent_keys,
            store,
        }
    }

    pub fn learn_peer_addresses(&mut self, addresses: Vec<Address>) {
        self.peer_db.learn_peer(addresses);
    }

    /// Seed the recent-keys window with one store key if the store already
    /// holds anything at startup (§3 `RecentKeysWindow` lifecycle).
    pub async fn seed_recent_keys(&mut self) {
        if let Some(key) = self.store.get_key_at_position(0).await {
            self.recent_keys.record(key);
        }
    }

    /// Handle a freshly completed handshake. Detects duplicate connections
    /// to the same remote identity (keeping the first, dropping the new
    /// one) and self-connections (the remote identity equals ours), per
    /// the spec's end-to-end scenarios on collapsing redundant sessions.
    pub fn handle_peer_online(
        &mut self,
        identity: NodeIdentity,
        address: Address,
        is_outgoing: bool,
    ) -> NetworkResult<()> {
        if identity == self.local_identity {
            self.peer_db.blocklist(Some(identity), Some(&address));
            return Err(NetworkError::ProtocolViolation(
                None,
                "refusing self-connection".to_string(),
            ));
        }
        if let Some(existing) = self.sessions.get(&identity) {
            // §3 invariant 2: the duplicate is closed, but its address is
            // still worth keeping against the surviving session's peer.
            // `verify_peer` alone would reset an already-exchangeable entry
            // back down to `verified`, so re-apply the surviving session's
            // outgoing status afterwards.
            self.peer_db
                .verify_peer(identity, &[existing.address.clone(), address]);
            if existing.is_outgoing {
                let _ = self.peer_db.mark_exchangeable(identity);
            }
            return Err(NetworkError::PolicyReject(
                "duplicate connection to peer".to_string(),
            ));
        }
        self.sessions.insert(
            identity,
            Session {
                address: address.clone(),
                is_outgoing,
            },
        );
        self.peer_db.verify_peer(identity, &[address]);
        if is_outgoing {
            // §4.4: outgoing sessions reach `exchangeable`, the partition
            // that gates peer-exchange gossip (§4.1); incoming sessions
            // stop at `verified`.
            let _ = self.peer_db.mark_exchangeable(identity);
        }
        info!(peer = %identity, outgoing = is_outgoing, "peer online");
        Ok(())
    }

    /// Read-only access to the peer catalog, for callers (tests, stats
    /// endpoints) that need to inspect partition membership directly.
    pub fn peer_db(&self) -> &PeerDb {
        &self.peer_db
    }

    pub fn handle_peer_closed(&mut self, identity: NodeIdentity) {
        self.sessions.remove(&identity);
    }

    pub fn record_key_seen(&mut self, key: CubeKey) -> bool {
        let already = self.recent_keys.contains(&key);
        self.recent_keys.record(key);
        already
    }

    /// Pick up to `self.config.minimum_outgoing_connections` new peers to
    /// dial, respecting the maximum-connections cap and excluding peers
    /// we're already sessioned with.
    pub fn peers_to_dial(&self) -> Vec<Address> {
        let outgoing_count = self.sessions.values().filter(|s| s.is_outgoing).count();
        if outgoing_count >= self.config.minimum_outgoing_connections
            || self.sessions.len() >= self.config.maximum_connections
        {
            return Vec::new();
        }
        let need = self.config.minimum_outgoing_connections - outgoing_count;
        let exclude: Vec<NodeIdentity> = self.sessions.keys().copied().collect();
        let mut out = Vec::new();
        for _ in 0..need {
            match self.peer_db.select_peer_to_connect(&exclude) {
                Some(peer) => out.push(peer.primary_address().clone()),
                None => break,
            }
        }
        out
    }

    /// Send an immediate `KeyResponse`-style announcement of a newly
    /// admitted cube's metadata to every online peer that hasn't already
    /// seen this key, without waiting for their next scheduled sync round
    /// (§4.4's `expressSync`).
    pub async fn express_sync(
        &mut self,
        key: CubeKey,
        msg: NetworkMessage,
        connections: &mut HashMap<NodeIdentity, Box<dyn Connection>>,
    ) {
        if self.record_key_seen(key) {
            return;
        }
        for (identity, conn) in connections.iter_mut() {
            debug!(peer = %identity, key = %key, "express sync fan-out");
            let _ = conn.send(&msg).await;
        }
    }

    pub fn stats(&self) -> NetworkManagerStats {
        NetworkManagerStats {
            online_peers: self.sessions.len(),
            outgoing_peers: self.sessions.values().filter(|s| s.is_outgoing).count(),
            incoming_peers: self.sessions.values().filter(|s| !s.is_outgoing).count(),
            known_peers: self.peer_db.len(),
            recent_keys: self.recent_keys.len(),
        }
    }

    pub fn uptime_since(&self, started_at: u64) -> u64 {
        now().saturating_sub(started_at)
    }
}

pub type SharedNetworkManager = Arc<Mutex<NetworkManager>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::store::InMemoryCubeStore;

    fn manager() -> NetworkManager {
        NetworkManager::new(NetConfig::default(), Arc::new(InMemoryCubeStore::new()))
    }

    #[test]
    fn self_connection_is_rejected_and_blocklisted() {
        let mut mgr = manager();
        let own = mgr.local_identity;
        let address = Address::websocket("x", 1);
        let result = mgr.handle_peer_online(own, address.clone(), true);
        assert!(matches!(result, Err(NetworkError::ProtocolViolation(..))));
        assert!(mgr.peer_db().is_blocked(Some(own), Some(&address)));
        assert_eq!(
            mgr.peer_db()
                .partition(crate::net::peer_db::Partition::Blocked)
                .len(),
            1
        );
    }

    #[test]
    fn outgoing_session_becomes_exchangeable() {
        let mut mgr = manager();
        let id = NodeIdentity::random();
        mgr.handle_peer_online(id, Address::websocket("a", 1), true)
            .unwrap();
        assert_eq!(
            mgr.peer_db()
                .partition(crate::net::peer_db::Partition::Exchangeable)
                .len(),
            1
        );
    }

    #[test]
    fn incoming_session_stays_verified_only() {
        let mut mgr = manager();
        let id = NodeIdentity::random();
        mgr.handle_peer_online(id, Address::websocket("a", 1), false)
            .unwrap();
        assert_eq!(
            mgr.peer_db()
                .partition(crate::net::peer_db::Partition::Verified)
                .len(),
            1
        );
        assert_eq!(
            mgr.peer_db()
                .partition(crate::net::peer_db::Partition::Exchangeable)
                .len(),
            0
        );
    }

    #[test]
    fn duplicate_connection_to_same_peer_is_rejected() {
        let mut mgr = manager();
        let id = NodeIdentity::random();
        mgr.handle_peer_online(id, Address::websocket("a", 1), true)
            .unwrap();
        let result = mgr.handle_peer_online(id, Address::websocket("b", 2), false);
        assert!(result.is_err());
    }

    #[test]
    fn recent_keys_window_dedupes_and_bounds() {
        let mut mgr = manager();
        let k = CubeKey::new([1; 32]);
        assert!(!mgr.record_key_seen(k));
        assert!(mgr.record_key_seen(k));
    }

    #[test]
    fn recent_keys_window_evicts_oldest_past_capacity() {
        let mut window = RecentKeysWindow::new(2);
        window.record(CubeKey::new([1; 32]));
        window.record(CubeKey::new([2; 32]));
        window.record(CubeKey::new([3; 32]));
        assert_eq!(window.len(), 2);
        assert!(!window.contains(&CubeKey::new([1; 32])));
        assert!(window.contains(&CubeKey::new([3; 32])));
    }

    #[test]
    fn stats_reflect_session_counts() {
        let mut mgr = manager();
        mgr.handle_peer_online(NodeIdentity::random(), Address::websocket("a", 1), true)
            .unwrap();
        mgr.handle_peer_online(NodeIdentity::random(), Address::websocket("b", 2), false)
            .unwrap();
        let stats = mgr.stats();
        assert_eq!(stats.online_peers, 2);
        assert_eq!(stats.outgoing_peers, 1);
        assert_eq!(stats.incoming_peers, 1);
    }
}
