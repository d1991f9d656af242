//! `NetworkPeer`: per-session state machine for one live connection,
//! driving the handshake and dispatching each of the eight message classes
//! (§4.3).
//!
//! Grounded on the teacher's `peer.rs` (per-connection state enum, dispatch
//! table, `misbehaving()` scoring on protocol violations).

use crate::net::address::Address;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::message::{
    NetworkMessage, SubscriptionConfirmationPayload, SubscriptionResponseCode,
};
use crate::net::store::{CubeInfo, CubeStore};
use crate::net::transport::Connection;
use crate::net::types::{
    CubeKey, CubeMeta, KeyRequestMode, MAX_CUBES_PER_MESSAGE, MAX_NODE_ADDRESS_COUNT, NodeIdentity,
    NotificationKey, PeerStatus, now,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// How much trust score a protocol violation costs. Repeated violations
/// accumulate; the caller (network manager) decides when to disconnect.
const MISBEHAVIOR_PENALTY: i32 = -10;

/// Live per-session state for one connected peer.
pub struct NetworkPeer {
    pub status: PeerStatus,
    pub remote_identity: Option<NodeIdentity>,
    pub remote_server_address: Option<Address>,
    pub last_activity: u64,
    pub trust_delta: i32,
    /// Cube metadata this peer has offered but we haven't yet requested.
    pub unsent_cube_metas: Vec<CubeMeta>,
    /// Peer addresses learned from this peer, not yet relayed onward.
    pub unsent_peers: Vec<Address>,
    pub cube_subscriptions: HashSet<CubeKey>,
    pub notification_subscriptions: HashSet<NotificationKey>,
    /// Keys this session has asked the remote for and is still awaiting a
    /// `CubeResponse` for, with the time each request was issued. A light
    /// node rejects anything not in this set (§4.3 CubeResponse handler, §7
    /// PolicyReject); the timestamp drives `check_request_timeouts`.
    requested_keys: HashMap<CubeKey, u64>,
    /// Whether this side is a light node; light nodes reject cubes they
    /// did not explicitly request.
    pub is_light_node: bool,
    store: Arc<dyn CubeStore>,
}

/// The result of dispatching one inbound message: either nothing further
/// to do, or a reply to send back immediately.
pub enum DispatchOutcome {
    Handled,
    Reply(NetworkMessage),
}

impl NetworkPeer {
    pub fn new(store: Arc<dyn CubeStore>) -> Self {
        Self::with_node_kind(store, false)
    }

    pub fn with_node_kind(store: Arc<dyn CubeStore>, is_light_node: bool) -> Self {
        Self {
            status: PeerStatus::Connecting,
            remote_identity: None,
            remote_server_address: None,
            last_activity: now(),
            trust_delta: 0,
            unsent_cube_metas: Vec::new(),
            unsent_peers: Vec::new(),
            cube_subscriptions: HashSet::new(),
            notification_subscriptions: HashSet::new(),
            requested_keys: HashMap::new(),
            is_light_node,
            store,
        }
    }

    fn touch(&mut self) {
        self.last_activity = now();
    }

    fn misbehave(&mut self, reason: &str) {
        self.trust_delta += MISBEHAVIOR_PENALTY;
        warn!(reason, trust_delta = self.trust_delta, "peer misbehaving");
    }

    /// Begin the handshake by sending our own `Hello`.
    pub async fn start_handshake(
        &mut self,
        conn: &mut dyn Connection,
        local_identity: NodeIdentity,
    ) -> NetworkResult<()> {
        self.status = PeerStatus::Handshaking;
        conn.send(&NetworkMessage::Hello {
            peer_id: local_identity,
            node_type: Some(1),
        })
        .await
    }

    /// Process one inbound message against the current state machine,
    /// applying whatever stored-cube side effects it implies and
    /// returning an optional immediate reply.
    pub async fn dispatch(&mut self, msg: NetworkMessage) -> NetworkResult<DispatchOutcome> {
        self.touch();
        match (&self.status, msg) {
            (PeerStatus::Handshaking, NetworkMessage::Hello { peer_id, .. }) => {
                self.remote_identity = Some(peer_id);
                self.status = PeerStatus::Online;
                Ok(DispatchOutcome::Handled)
            }
            (PeerStatus::Handshaking, _) => {
                self.misbehave("message before handshake completed");
                Err(NetworkError::ProtocolViolation(
                    None,
                    "expected Hello".to_string(),
                ))
            }
            (PeerStatus::Online, msg) => self.dispatch_online(msg).await,
            (status, _) => Err(NetworkError::ProtocolViolation(
                None,
                format!("message while {status:?}"),
            )),
        }
    }

    async fn dispatch_online(&mut self, msg: NetworkMessage) -> NetworkResult<DispatchOutcome> {
        match msg {
            NetworkMessage::Hello { .. } => {
                self.misbehave("duplicate Hello");
                Err(NetworkError::ProtocolViolation(
                    None,
                    "duplicate Hello".to_string(),
                ))
            }
            NetworkMessage::KeyRequest {
                mode,
                count,
                start_key,
                notify_key,
                time_min,
                time_max,
                ..
            } => {
                self.handle_key_request(mode, count, start_key, notify_key, time_min, time_max)
                    .await
            }
            NetworkMessage::KeyResponse { metas, .. } => self.handle_key_response(metas).await,
            NetworkMessage::CubeRequest { keys } => self.handle_cube_request(keys).await,
            NetworkMessage::CubeResponse { cubes } => self.handle_cube_response(cubes).await,
            NetworkMessage::MyServerAddress { address } => {
                self.remote_server_address = Some(address);
                Ok(DispatchOutcome::Handled)
            }
            NetworkMessage::PeerRequest => Ok(self.handle_peer_request()),
            NetworkMessage::PeerResponse { addresses } => {
                self.unsent_peers.extend(addresses);
                Ok(DispatchOutcome::Handled)
            }
            NetworkMessage::SubscribeCube { keys } => {
                for k in &keys {
                    self.cube_subscriptions.insert(*k);
                }
                Ok(DispatchOutcome::Reply(
                    NetworkMessage::SubscriptionConfirmation(SubscriptionConfirmationPayload {
                        code: SubscriptionResponseCode::Confirmed,
                        requested_key_blob: keys.first().map(|k| k.0).unwrap_or([0; 32]),
                        cubes_hash_blob: None,
                        duration_secs: Some(600),
                    }),
                ))
            }
            NetworkMessage::SubscribeNotifications { recipients } => {
                for r in &recipients {
                    self.notification_subscriptions.insert(*r);
                }
                Ok(DispatchOutcome::Reply(
                    NetworkMessage::SubscriptionConfirmation(SubscriptionConfirmationPayload {
                        code: SubscriptionResponseCode::Confirmed,
                        requested_key_blob: recipients.first().map(|k| k.0).unwrap_or([0; 32]),
                        cubes_hash_blob: None,
                        duration_secs: Some(600),
                    }),
                ))
            }
            NetworkMessage::SubscriptionConfirmation(_) => Ok(DispatchOutcome::Handled),
        }
    }

    async fn handle_key_request(
        &mut self,
        mode: KeyRequestMode,
        count: u32,
        start_key: CubeKey,
        notify_key: Option<NotificationKey>,
        _time_min: Option<u64>,
        _time_max: Option<u64>,
    ) -> NetworkResult<DispatchOutcome> {
        match mode {
            KeyRequestMode::NotificationChallenge | KeyRequestMode::NotificationTimestamp => {
                let recipient = notify_key.ok_or_else(|| {
                    NetworkError::ProtocolViolation(
                        None,
                        "notification request missing key".to_string(),
                    )
                })?;
                let cubes = self.store.get_notifications(recipient).await;
                let metas = cubes.into_iter().map(|c| c.meta).collect();
                Ok(DispatchOutcome::Reply(NetworkMessage::KeyResponse {
                    mode,
                    metas,
                }))
            }
            _ => {
                let mut metas = Vec::new();
                let mut position = 0u64;
                let mut started = start_key == CubeKey::new([0; 32]);
                while metas.len() < count as usize {
                    match self.store.get_key_at_position(position).await {
                        Some(k) => {
                            if started {
                                if let Some(info) = self.store.get_cube_info(k).await {
                                    metas.push(info.meta);
                                }
                            } else if k == start_key {
                                started = true;
                            }
                            position += 1;
                        }
                        None => break,
                    }
                }
                Ok(DispatchOutcome::Reply(NetworkMessage::KeyResponse {
                    mode,
                    metas,
                }))
            }
        }
    }

    /// KeyResponse handler (§4.3): decide, for each offered `CubeMeta`,
    /// whether it's worth fetching. Absent keys are always requested; an
    /// already-stored mutable cube is re-requested whenever the offered
    /// meta's `date` is no worse than what's on hand — the wire-level meta
    /// doesn't carry a PMUC `updatecount`, so this is a prefetch heuristic;
    /// the authoritative cube contest runs in `add_cube` once the full
    /// cube arrives.
    async fn handle_key_response(
        &mut self,
        metas: Vec<CubeMeta>,
    ) -> NetworkResult<DispatchOutcome> {
        let mut to_request = Vec::new();
        for meta in metas {
            if to_request.len() >= MAX_CUBES_PER_MESSAGE {
                break;
            }
            match self.store.get_cube_info(meta.key).await {
                None => to_request.push(meta.key),
                Some(stored) if meta.cube_type.is_mutable() && meta.date >= stored.meta.date => {
                    to_request.push(meta.key);
                }
                Some(_) => {}
            }
        }
        if to_request.is_empty() {
            return Ok(DispatchOutcome::Handled);
        }
        let issued_at = now();
        for key in &to_request {
            self.requested_keys.insert(*key, issued_at);
        }
        Ok(DispatchOutcome::Reply(NetworkMessage::CubeRequest {
            keys: to_request,
        }))
    }

    /// PeerRequest handler (§4.3): gossip up to `MAX_NODE_ADDRESS_COUNT`
    /// addresses not yet relayed to this peer, removing them from the
    /// backlog so the next request doesn't repeat them.
    fn handle_peer_request(&mut self) -> DispatchOutcome {
        let take = self.unsent_peers.len().min(MAX_NODE_ADDRESS_COUNT);
        let addresses: Vec<Address> = self.unsent_peers.drain(..take).collect();
        DispatchOutcome::Reply(NetworkMessage::PeerResponse { addresses })
    }

    async fn handle_cube_request(&mut self, keys: Vec<CubeKey>) -> NetworkResult<DispatchOutcome> {
        let mut cubes = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(bytes) = self.store.get_cube(k).await {
                cubes.push(bytes);
            }
        }
        Ok(DispatchOutcome::Reply(NetworkMessage::CubeResponse {
            cubes,
        }))
    }

    /// CubeResponse handler (§4.3, §7 PolicyReject): a light node drops any
    /// cube it did not itself request, before it ever reaches the store.
    /// A cube that changes the stored winner credits the sender's trust
    /// score proportionally to its difficulty; one that loses the contest
    /// or duplicates the existing winner earns nothing (§9 open question
    /// (b)).
    async fn handle_cube_response(
        &mut self,
        cubes: Vec<Vec<u8>>,
    ) -> NetworkResult<DispatchOutcome> {
        for raw in cubes {
            if self.is_light_node {
                match self.store.peek_cube_key(&raw) {
                    Some(key) if self.requested_keys.contains_key(&key) => {
                        self.requested_keys.remove(&key);
                    }
                    _ => {
                        warn!("dropping unrequested cube from light-node session");
                        continue;
                    }
                }
            } else if let Some(key) = self.store.peek_cube_key(&raw) {
                self.requested_keys.remove(&key);
            }
            match self.store.add_cube(raw).await {
                Ok(Some(winner)) => {
                    self.trust_delta += winner.meta.difficulty as i32;
                }
                Ok(None) => {}
                Err(e) => self.misbehave(&format!("rejected cube: {e}")),
            }
        }
        Ok(DispatchOutcome::Handled)
    }

    /// Store `cubeAdded` hook (§4.3): called for every cube newly admitted
    /// locally. If this remote is subscribed to the key, push it
    /// unsolicited right away; otherwise just queue the meta for the next
    /// periodic `KeyResponse` round.
    pub fn on_cube_added(&mut self, info: &CubeInfo) -> Option<NetworkMessage> {
        if self.cube_subscriptions.contains(&info.meta.key) {
            return Some(NetworkMessage::CubeResponse {
                cubes: vec![info.raw.clone()],
            });
        }
        self.unsent_cube_metas.push(info.meta);
        None
    }

    pub fn is_idle(&self, idle_secs: u64) -> bool {
        now().saturating_sub(self.last_activity) >= idle_secs
    }

    /// Sweep outstanding cube requests against `request_timeout_secs` (§4.3
    /// Timeouts, §7 Timeout). Every key still awaiting a reply past the
    /// deadline is dropped from `requested_keys` so it can be retried
    /// elsewhere. If `close_on_timeout` is set and anything timed out, the
    /// session transitions to `Closing` and the caller is expected to tear
    /// down the connection; returns whether that happened.
    pub fn check_request_timeouts(
        &mut self,
        request_timeout_secs: u64,
        close_on_timeout: bool,
    ) -> bool {
        let deadline = now();
        let timed_out: Vec<CubeKey> = self
            .requested_keys
            .iter()
            .filter(|(_, issued_at)| deadline.saturating_sub(**issued_at) >= request_timeout_secs)
            .map(|(key, _)| *key)
            .collect();
        if timed_out.is_empty() {
            return false;
        }
        for key in &timed_out {
            self.requested_keys.remove(key);
        }
        if close_on_timeout {
            self.status = PeerStatus::Closing;
            return true;
        }
        false
    }

    pub fn close(&mut self) {
        self.status = PeerStatus::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::store::{InMemoryCubeStore, encode_test_cube};
    use crate::net::types::CubeType;

    async fn store_with_cube() -> (Arc<InMemoryCubeStore>, CubeKey) {
        let store = Arc::new(InMemoryCubeStore::new());
        let key = CubeKey::new([1; 32]);
        let raw = encode_test_cube(key, CubeType::Frozen, 1, 1000, 0, b"hi");
        store.add_cube(raw).await.unwrap();
        (store, key)
    }

    #[tokio::test]
    async fn rejects_messages_before_hello() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Handshaking;
        let result = peer.dispatch(NetworkMessage::PeerRequest).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hello_transitions_to_online() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Handshaking;
        peer.dispatch(NetworkMessage::Hello {
            peer_id: NodeIdentity([1; 16]),
            node_type: None,
        })
        .await
        .unwrap();
        assert_eq!(peer.status, PeerStatus::Online);
        assert_eq!(peer.remote_identity, Some(NodeIdentity([1; 16])));
    }

    #[tokio::test]
    async fn cube_request_replies_with_stored_cube() {
        let (store, key) = store_with_cube().await;
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let outcome = peer
            .dispatch(NetworkMessage::CubeRequest { keys: vec![key] })
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Reply(NetworkMessage::CubeResponse { cubes }) => {
                assert_eq!(cubes.len(), 1)
            }
            _ => panic!("expected CubeResponse"),
        }
    }

    #[tokio::test]
    async fn subscribe_cube_confirms_subscription() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([2; 32]);
        let outcome = peer
            .dispatch(NetworkMessage::SubscribeCube { keys: vec![key] })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Reply(NetworkMessage::SubscriptionConfirmation(_))
        ));
        assert!(peer.cube_subscriptions.contains(&key));
    }

    #[tokio::test]
    async fn key_response_for_absent_cube_requests_it() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([3; 32]);
        let meta = CubeMeta {
            key,
            cube_type: CubeType::Frozen,
            difficulty: 1,
            date: 1000,
        };
        let outcome = peer
            .dispatch(NetworkMessage::KeyResponse {
                mode: KeyRequestMode::SlidingWindow,
                metas: vec![meta],
            })
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Reply(NetworkMessage::CubeRequest { keys }) => {
                assert_eq!(keys, vec![key])
            }
            _ => panic!("expected a CubeRequest"),
        }
    }

    #[tokio::test]
    async fn key_response_for_already_stored_frozen_cube_is_ignored() {
        let (store, key) = store_with_cube().await;
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let meta = CubeMeta {
            key,
            cube_type: CubeType::Frozen,
            difficulty: 1,
            date: 1000,
        };
        let outcome = peer
            .dispatch(NetworkMessage::KeyResponse {
                mode: KeyRequestMode::SlidingWindow,
                metas: vec![meta],
            })
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Handled));
    }

    #[tokio::test]
    async fn peer_request_replies_with_unsent_peers_and_drains_backlog() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        peer.unsent_peers.push(Address::websocket("a", 1));
        peer.unsent_peers.push(Address::websocket("b", 2));
        let outcome = peer.dispatch(NetworkMessage::PeerRequest).await.unwrap();
        match outcome {
            DispatchOutcome::Reply(NetworkMessage::PeerResponse { addresses }) => {
                assert_eq!(addresses.len(), 2)
            }
            _ => panic!("expected a PeerResponse"),
        }
        assert!(peer.unsent_peers.is_empty());
    }

    #[tokio::test]
    async fn cube_response_credits_trust_proportional_to_difficulty() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let raw = encode_test_cube(CubeKey::new([4; 32]), CubeType::Frozen, 7, 1000, 0, b"data");
        peer.dispatch(NetworkMessage::CubeResponse { cubes: vec![raw] })
            .await
            .unwrap();
        assert_eq!(peer.trust_delta, 7);
    }

    #[tokio::test]
    async fn cube_response_duplicate_insertion_earns_no_credit() {
        let (store, key) = store_with_cube().await;
        let mut peer = NetworkPeer::new(store.clone());
        peer.status = PeerStatus::Online;
        let raw = store.get_cube(key).await.unwrap();
        peer.dispatch(NetworkMessage::CubeResponse { cubes: vec![raw] })
            .await
            .unwrap();
        assert_eq!(peer.trust_delta, 0);
    }

    #[tokio::test]
    async fn light_node_drops_unrequested_cube_response() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::with_node_kind(store.clone(), true);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([5; 32]);
        let raw = encode_test_cube(key, CubeType::Frozen, 1, 1000, 0, b"unsolicited");
        peer.dispatch(NetworkMessage::CubeResponse { cubes: vec![raw] })
            .await
            .unwrap();
        assert!(!store.has_cube(key).await);
        assert_eq!(peer.trust_delta, 0);
    }

    #[tokio::test]
    async fn light_node_accepts_a_cube_it_requested() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::with_node_kind(store.clone(), true);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([6; 32]);
        let meta = CubeMeta {
            key,
            cube_type: CubeType::Frozen,
            difficulty: 1,
            date: 1000,
        };
        peer.dispatch(NetworkMessage::KeyResponse {
            mode: KeyRequestMode::SlidingWindow,
            metas: vec![meta],
        })
        .await
        .unwrap();
        let raw = encode_test_cube(key, CubeType::Frozen, 1, 1000, 0, b"requested");
        peer.dispatch(NetworkMessage::CubeResponse { cubes: vec![raw] })
            .await
            .unwrap();
        assert!(store.has_cube(key).await);
    }

    #[tokio::test]
    async fn request_timeout_without_close_on_timeout_just_clears_the_key() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([8; 32]);
        peer.requested_keys.insert(key, 0);
        let closed = peer.check_request_timeouts(5, false);
        assert!(!closed);
        assert!(!peer.requested_keys.contains_key(&key));
        assert_eq!(peer.status, PeerStatus::Online);
    }

    #[tokio::test]
    async fn request_timeout_with_close_on_timeout_closes_the_session() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([9; 32]);
        peer.requested_keys.insert(key, 0);
        let closed = peer.check_request_timeouts(5, true);
        assert!(closed);
        assert_eq!(peer.status, PeerStatus::Closing);
    }

    #[tokio::test]
    async fn request_within_timeout_window_is_left_alone() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([10; 32]);
        peer.requested_keys.insert(key, now());
        let closed = peer.check_request_timeouts(5, true);
        assert!(!closed);
        assert!(peer.requested_keys.contains_key(&key));
        assert_eq!(peer.status, PeerStatus::Online);
    }

    #[tokio::test]
    async fn cube_added_pushes_unsolicited_response_to_subscriber() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store.clone());
        peer.status = PeerStatus::Online;
        let key = CubeKey::new([7; 32]);
        peer.cube_subscriptions.insert(key);
        let raw = encode_test_cube(key, CubeType::Frozen, 1, 1000, 0, b"pushed");
        let info = store.get_cube_info(key).await;
        assert!(info.is_none());
        let info = crate::net::store::CubeInfo {
            meta: CubeMeta {
                key,
                cube_type: CubeType::Frozen,
                difficulty: 1,
                date: 1000,
            },
            update_count: 0,
            expiration: 2000,
            raw: raw.clone(),
        };
        let msg = peer.on_cube_added(&info);
        match msg {
            Some(NetworkMessage::CubeResponse { cubes }) => assert_eq!(cubes, vec![raw]),
            _ => panic!("expected an unsolicited CubeResponse"),
        }
    }

    #[tokio::test]
    async fn cube_added_queues_meta_for_non_subscriber() {
        let store = Arc::new(InMemoryCubeStore::new());
        let mut peer = NetworkPeer::new(store);
        let key = CubeKey::new([8; 32]);
        let info = crate::net::store::CubeInfo {
            meta: CubeMeta {
                key,
                cube_type: CubeType::Frozen,
                difficulty: 1,
                date: 1000,
            },
            update_count: 0,
            expiration: 2000,
            raw: vec![],
        };
        let msg = peer.on_cube_added(&info);
        assert!(msg.is_none());
        assert_eq!(peer.unsent_cube_metas.len(), 1);
    }
}
