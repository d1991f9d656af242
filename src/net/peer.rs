//! `Peer`: a catalog entry in the `PeerDB` — a set of addresses plus an
//! optional identity and reputation bookkeeping. Not to be confused with
//! `NetworkPeer` (network_peer.rs), which is a live session.

use crate::net::address::Address;
use crate::net::types::{NodeIdentity, now};
use serde::{Deserialize, Serialize};

/// A catalog entry: addresses the overlay has heard for a node, plus
/// reputation and connection-history bookkeeping.
///
/// Equality (§3): two peers are equal if they share an identity, or if any
/// address is in common. This is intentionally not a derived `PartialEq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub identity: Option<NodeIdentity>,
    pub addresses: Vec<Address>,
    pub primary_index: usize,
    pub last_connect_attempt: u64,
    pub last_successful_connection: u64,
    pub connection_attempts: u32,
    pub trust_score: i32,
}

impl Peer {
    pub fn new(addresses: Vec<Address>) -> Self {
        assert!(
            !addresses.is_empty(),
            "a Peer must have at least one address"
        );
        Self {
            identity: None,
            addresses,
            primary_index: 0,
            last_connect_attempt: 0,
            last_successful_connection: 0,
            connection_attempts: 0,
            trust_score: 0,
        }
    }

    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn primary_address(&self) -> &Address {
        &self.addresses[self.primary_index.min(self.addresses.len() - 1)]
    }

    /// Merge another peer's addresses into this one, deduplicating.
    pub fn merge_addresses(&mut self, other: &[Address]) {
        for addr in other {
            if !self.addresses.contains(addr) {
                self.addresses.push(addr.clone());
            }
        }
    }

    pub fn record_attempt(&mut self) {
        self.last_connect_attempt = now();
        self.connection_attempts = self.connection_attempts.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.last_successful_connection = now();
        self.connection_attempts = 0;
    }

    pub fn adjust_trust(&mut self, delta: i32) {
        self.trust_score = self.trust_score.saturating_add(delta);
    }

    /// Shares an identity, or any address, with `other`.
    pub fn matches(&self, other: &Peer) -> bool {
        match (self.identity, other.identity) {
            (Some(a), Some(b)) if a == b => return true,
            _ => {}
        }
        self.addresses.iter().any(|a| other.addresses.contains(a))
    }

    pub fn matches_address(&self, addr: &Address) -> bool {
        self.addresses.contains(addr)
    }

    pub fn matches_identity(&self, id: NodeIdentity) -> bool {
        self.identity == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::websocket("127.0.0.1", port)
    }

    #[test]
    fn matches_by_shared_identity() {
        let id = NodeIdentity::random();
        let a = Peer::new(vec![addr(1)]).with_identity(id);
        let b = Peer::new(vec![addr(2)]).with_identity(id);
        assert!(a.matches(&b));
    }

    #[test]
    fn matches_by_shared_address() {
        let a = Peer::new(vec![addr(1), addr(2)]);
        let b = Peer::new(vec![addr(2), addr(3)]);
        assert!(a.matches(&b));
    }

    #[test]
    fn distinct_peers_do_not_match() {
        let a = Peer::new(vec![addr(1)]);
        let b = Peer::new(vec![addr(2)]);
        assert!(!a.matches(&b));
    }

    #[test]
    fn merge_addresses_deduplicates() {
        let mut a = Peer::new(vec![addr(1)]);
        a.merge_addresses(&[addr(1), addr(2)]);
        assert_eq!(a.addresses.len(), 2);
    }
}
