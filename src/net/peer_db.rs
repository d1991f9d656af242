//! `PeerDB`: the catalog of known peers, partitioned into `unverified`,
//! `verified`, `exchangeable`, and `blocked` sets (§4.1).
//!
//! Grounded on the teacher's `addrman.rs` (tried/new table split, persistence,
//! weighted selection) generalized from IP-bucket addresses to the spec's
//! identity-or-address peer equality, plus `discouraged.rs`/`verified_peers.rs`
//! for the blocklist/verified-set shape.

use crate::net::address::Address;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::peer::Peer;
use crate::net::strategy::{trust_weight, weighted_choice};
use crate::net::types::{NodeIdentity, now};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Which partition a peer currently occupies. The sets are pairwise
/// disjoint; `Blocked` dominates — a blocklisted peer is never reported as
/// a member of any other partition (§3, invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Unverified,
    Verified,
    Exchangeable,
    Blocked,
}

/// A peer as tracked by the catalog, tagged with its partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    peer: Peer,
    partition_tag: u8,
}

fn tag_of(p: Partition) -> u8 {
    match p {
        Partition::Unverified => 0,
        Partition::Verified => 1,
        Partition::Exchangeable => 2,
        Partition::Blocked => 3,
    }
}

fn partition_of(tag: u8) -> Partition {
    match tag {
        1 => Partition::Verified,
        2 => Partition::Exchangeable,
        3 => Partition::Blocked,
        _ => Partition::Unverified,
    }
}

/// Snapshot format persisted to disk.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<Entry>,
}

/// Guard against loading a corrupted or hostile oversized snapshot file,
/// mirroring the teacher's `AddrMan::load` sanity check.
const MAX_SNAPSHOT_BYTES: u64 = 64 * 1024 * 1024;

pub struct PeerDbConfig {
    /// Chance [0,1] a blocklisted peer is given another try per selection
    /// round instead of being permanently excluded.
    pub bad_peer_rehabilitation_chance: f64,
    /// Minimum interval between connection attempts to the same peer.
    pub reconnect_interval_secs: u64,
}

impl Default for PeerDbConfig {
    fn default() -> Self {
        Self {
            bad_peer_rehabilitation_chance: 0.1,
            reconnect_interval_secs: 60,
        }
    }
}

/// The peer catalog. Not `Send`-shared directly; owned by the
/// `NetworkManager` actor task and accessed only from within it.
pub struct PeerDb {
    entries: Vec<Entry>,
    config: PeerDbConfig,
}

impl PeerDb {
    pub fn new(config: PeerDbConfig) -> Self {
        Self {
            entries: Vec::new(),
            config,
        }
    }

    fn find_index(&self, peer: &Peer) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.matches(peer))
    }

    /// Record a freshly learned peer (e.g. from a `PeerResponse`) into the
    /// `unverified` partition, or merge its addresses if already known.
    pub fn learn_peer(&mut self, addresses: Vec<Address>) {
        let candidate = Peer::new(addresses.clone());
        if let Some(idx) = self.find_index(&candidate) {
            self.entries[idx].peer.merge_addresses(&addresses);
        } else {
            self.entries.push(Entry {
                peer: candidate,
                partition_tag: tag_of(Partition::Unverified),
            });
        }
    }

    /// Promote a peer to `verified` after a successful handshake.
    pub fn verify_peer(&mut self, identity: NodeIdentity, addresses: &[Address]) {
        let probe = Peer::new(addresses.to_vec()).with_identity(identity);
        match self.find_index(&probe) {
            Some(idx) => {
                self.entries[idx].peer.identity = Some(identity);
                self.entries[idx].peer.merge_addresses(addresses);
                self.entries[idx].peer.record_success();
                if partition_of(self.entries[idx].partition_tag) != Partition::Blocked {
                    self.entries[idx].partition_tag = tag_of(Partition::Verified);
                }
            }
            None => {
                let mut peer = Peer::new(addresses.to_vec()).with_identity(identity);
                peer.record_success();
                self.entries.push(Entry {
                    peer,
                    partition_tag: tag_of(Partition::Verified),
                });
            }
        }
    }

    /// Mark a verified peer as a candidate for exchange to other peers
    /// (e.g. it accepted incoming connections successfully).
    pub fn mark_exchangeable(&mut self, identity: NodeIdentity) -> NetworkResult<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.peer.identity == Some(identity))
            .ok_or_else(|| NetworkError::PolicyReject("unknown peer".to_string()))?;
        if partition_of(self.entries[idx].partition_tag) != Partition::Blocked {
            self.entries[idx].partition_tag = tag_of(Partition::Exchangeable);
        }
        Ok(())
    }

    /// Blocklist a peer by identity and/or address. Blocklisting dominates:
    /// once blocked, a peer is excluded from every other partition view.
    pub fn blocklist(&mut self, identity: Option<NodeIdentity>, address: Option<&Address>) {
        let mut touched = false;
        for e in self.entries.iter_mut() {
            let by_identity = identity.is_some() && e.peer.identity == identity;
            let by_address = address.map(|a| e.peer.matches_address(a)).unwrap_or(false);
            if by_identity || by_address {
                e.partition_tag = tag_of(Partition::Blocked);
                touched = true;
            }
        }
        if !touched && let (Some(addr), _) = (address, identity) {
            let mut peer = Peer::new(vec![addr.clone()]);
            if let Some(id) = identity {
                peer.identity = Some(id);
            }
            self.entries.push(Entry {
                peer,
                partition_tag: tag_of(Partition::Blocked),
            });
        }
    }

    pub fn is_blocked(&self, identity: Option<NodeIdentity>, address: Option<&Address>) -> bool {
        self.entries.iter().any(|e| {
            partition_of(e.partition_tag) == Partition::Blocked
                && ((identity.is_some() && e.peer.identity == identity)
                    || address.map(|a| e.peer.matches_address(a)).unwrap_or(false))
        })
    }

    pub fn partition(&self, p: Partition) -> Vec<&Peer> {
        self.entries
            .iter()
            .filter(|e| partition_of(e.partition_tag) == p)
            .map(|e| &e.peer)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select a peer to dial next, weighted by trust score, respecting the
    /// reconnect interval and excluding any identity in `exclude`. Selection
    /// is over `verified ∪ unverified ∖ exclude` only — `Blocked` peers are
    /// excluded unconditionally (invariant 6, blocklist dominates); a
    /// peer with a negative trust score is still eligible but weighted down
    /// to the floor set by `bad_peer_rehabilitation_chance` (§4.1).
    pub fn select_peer_to_connect(&self, exclude: &[NodeIdentity]) -> Option<Peer> {
        let now_ts = now();
        let mut weights: HashMap<usize, f64> = HashMap::new();
        for (i, e) in self.entries.iter().enumerate() {
            if let Some(id) = e.peer.identity
                && exclude.contains(&id)
            {
                continue;
            }
            if partition_of(e.partition_tag) == Partition::Blocked {
                continue;
            }
            if now_ts.saturating_sub(e.peer.last_connect_attempt)
                < self.config.reconnect_interval_secs
                && e.peer.last_connect_attempt != 0
            {
                continue;
            }
            weights.insert(
                i,
                trust_weight(
                    e.peer.trust_score,
                    self.config.bad_peer_rehabilitation_chance,
                ),
            );
        }
        let idx = weighted_choice(&weights)?;
        Some(self.entries[idx].peer.clone())
    }

    pub fn record_attempt(&mut self, peer: &Peer) {
        if let Some(idx) = self.find_index(peer) {
            self.entries[idx].peer.record_attempt();
        }
    }

    pub fn adjust_trust(&mut self, identity: NodeIdentity, delta: i32) {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.peer.identity == Some(identity))
        {
            self.entries[idx].peer.adjust_trust(delta);
        }
    }

    /// Serialize the full catalog to disk via bincode.
    pub fn save(&self, path: &Path) -> NetworkResult<()> {
        let snapshot = Snapshot {
            entries: self.entries.clone(),
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| NetworkError::Storage(format!("serialize peer db: {e}")))?;
        std::fs::write(path, bytes)
            .map_err(|e| NetworkError::Storage(format!("write peer db: {e}")))
    }

    /// Load the catalog from disk, refusing files larger than
    /// `MAX_SNAPSHOT_BYTES` to avoid an unbounded allocation from a
    /// corrupted or adversarial file.
    pub fn load(path: &Path, config: PeerDbConfig) -> NetworkResult<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| NetworkError::Storage(format!("stat peer db: {e}")))?;
        if meta.len() > MAX_SNAPSHOT_BYTES {
            return Err(NetworkError::Storage(format!(
                "peer db snapshot too large ({} bytes)",
                meta.len()
            )));
        }
        let bytes =
            std::fs::read(path).map_err(|e| NetworkError::Storage(format!("read peer db: {e}")))?;
        let snapshot: Snapshot = bincode::deserialize(&bytes)
            .map_err(|e| NetworkError::Storage(format!("parse peer db: {e}")))?;
        Ok(Self {
            entries: snapshot.entries,
            config,
        })
    }
}

/// BitTorrent-style tracker client, as an optional bootstrap source of peer
/// addresses (§4.1, Non-goals exclude building a tracker server, not a
/// client).
#[async_trait]
pub trait TrackerClient: Send + Sync {
    async fn announce(&self, info_hash: &[u8; 20]) -> NetworkResult<Vec<Address>>;
}

/// Decode a BitTorrent compact peer list: 6 bytes per IPv4 peer
/// (4 address + 2 port) or 18 bytes per IPv6 peer, big-endian port.
pub fn decode_compact_peers(bytes: &[u8], ipv6: bool) -> Vec<Address> {
    let stride = if ipv6 { 18 } else { 6 };
    bytes
        .chunks_exact(stride)
        .map(|chunk| {
            let (ip_bytes, port_bytes) = chunk.split_at(stride - 2);
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            let host = if ipv6 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip_bytes);
                std::net::Ipv6Addr::from(octets).to_string()
            } else {
                std::net::Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3])
                    .to_string()
            };
            Address::websocket(host, port)
        })
        .collect()
}

/// HTTP tracker client using a simple GET announce, per the BEP 3 compact
/// peer format.
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    pub fn new(announce_url: impl Into<String>) -> Self {
        Self {
            announce_url: announce_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, info_hash: &[u8; 20]) -> NetworkResult<Vec<Address>> {
        let hash_qs: String = info_hash.iter().map(|b| format!("%{b:02X}")).collect();
        let url = format!("{}?info_hash={}&compact=1", self.announce_url, hash_qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkError::Transport(None, format!("tracker announce: {e}")))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| NetworkError::Transport(None, format!("tracker response: {e}")))?;
        Ok(decode_compact_peers(&body, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::websocket("127.0.0.1", port)
    }

    #[test]
    fn learn_then_verify_moves_partition() {
        let mut db = PeerDb::new(PeerDbConfig::default());
        db.learn_peer(vec![addr(1)]);
        assert_eq!(db.partition(Partition::Unverified).len(), 1);
        let id = NodeIdentity::random();
        db.verify_peer(id, &[addr(1)]);
        assert_eq!(db.partition(Partition::Verified).len(), 1);
        assert_eq!(db.partition(Partition::Unverified).len(), 0);
    }

    #[test]
    fn blocklist_dominates_other_partitions() {
        let mut db = PeerDb::new(PeerDbConfig::default());
        let id = NodeIdentity::random();
        db.verify_peer(id, &[addr(1)]);
        db.blocklist(Some(id), None);
        assert_eq!(db.partition(Partition::Verified).len(), 0);
        assert_eq!(db.partition(Partition::Blocked).len(), 1);
        assert!(db.is_blocked(Some(id), None));
    }

    #[test]
    fn exclude_list_is_respected_in_selection() {
        let mut db = PeerDb::new(PeerDbConfig::default());
        let id = NodeIdentity::random();
        db.verify_peer(id, &[addr(1)]);
        assert!(db.select_peer_to_connect(&[id]).is_none());
    }

    #[test]
    fn compact_ipv4_peer_list_decodes() {
        let bytes = [127, 0, 0, 1, 0x0B, 0xC5];
        let peers = decode_compact_peers(&bytes, false);
        assert_eq!(peers, vec![Address::websocket("127.0.0.1", 3013)]);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let mut db = PeerDb::new(PeerDbConfig::default());
        db.learn_peer(vec![addr(7)]);
        let path =
            std::env::temp_dir().join(format!("cubeswarm-peerdb-test-{}", std::process::id()));
        db.save(&path).unwrap();
        let loaded = PeerDb::load(&path, PeerDbConfig::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        std::fs::remove_file(&path).ok();
    }
}
