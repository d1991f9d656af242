//! The cube storage contract this crate consumes (§1, §6). The engine
//! itself — on-disk format, cryptography, retention policy details — is out
//! of scope; this module only defines the trait boundary plus an in-memory
//! test double used by this crate's own tests.

use crate::net::types::{CubeKey, CubeMeta, CubeType, NotificationKey, now};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Everything the network layer knows about a stored cube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeInfo {
    pub meta: CubeMeta,
    /// PMUC update counter; 0 for frozen/MUC cubes.
    pub update_count: u64,
    /// Derived expiration, used to break PMUC ties. Monotonic in
    /// (difficulty, date) as the store defines it; the core treats it as
    /// an opaque comparable value.
    pub expiration: u64,
    pub raw: Vec<u8>,
}

/// The cube contest (§4.6, glossary): a total, deterministic order over two
/// cubes sharing a key. Frozen cubes never conflict (the caller should not
/// invoke this for them, since their key is a content hash).
pub fn cube_contest<'a>(stored: &'a CubeInfo, offered: &'a CubeInfo) -> &'a CubeInfo {
    match stored.meta.cube_type {
        CubeType::Frozen => stored,
        CubeType::Muc => {
            if offered.meta.date > stored.meta.date {
                offered
            } else {
                stored
            }
        }
        CubeType::Pmuc => match offered.update_count.cmp(&stored.update_count) {
            std::cmp::Ordering::Greater => offered,
            std::cmp::Ordering::Less => stored,
            std::cmp::Ordering::Equal => {
                if offered.expiration > stored.expiration {
                    offered
                } else {
                    stored
                }
            }
        },
    }
}

/// A store-provided predicate discarding cubes unlikely to be kept under
/// current difficulty/age rules. `None` disables retention filtering.
pub trait RetentionPolicy: Send + Sync {
    fn should_retain(&self, meta: &CubeMeta, current_epoch: u64) -> bool;
}

/// Accepts everything; the default when no retention policy is configured.
pub struct NoRetentionPolicy;

impl RetentionPolicy for NoRetentionPolicy {
    fn should_retain(&self, _meta: &CubeMeta, _current_epoch: u64) -> bool {
        true
    }
}

/// Key-value cube store consumed by `NetworkPeer`/`RequestScheduler`.
#[async_trait]
pub trait CubeStore: Send + Sync {
    async fn has_cube(&self, key: CubeKey) -> bool;
    async fn get_cube_info(&self, key: CubeKey) -> Option<CubeInfo>;
    async fn get_cube(&self, key: CubeKey) -> Option<Vec<u8>>;
    /// Insert a cube from raw bytes; resolves MUC/PMUC contests against any
    /// existing cube at that key. Returns the winning `CubeInfo` if this
    /// insertion changed the stored state (spec.md's "successful insertion").
    async fn add_cube(&self, raw: Vec<u8>) -> Result<Option<CubeInfo>, String>;
    async fn get_notifications(&self, recipient: NotificationKey) -> Vec<CubeInfo>;
    /// The key stored at a stable iteration position, used to seed the
    /// recent-keys window at startup.
    async fn get_key_at_position(&self, position: u64) -> Option<CubeKey>;
    /// Subscribe to newly admitted cubes. Each call gets its own receiver.
    fn subscribe_cube_added(&self) -> broadcast::Receiver<CubeInfo>;
    /// Extract the key a raw cube would be stored under, without inserting
    /// it. Lets a light node reject an unsolicited `CubeResponse` entry
    /// before it ever reaches `add_cube` (§4.3 CubeResponse handler).
    fn peek_cube_key(&self, raw: &[u8]) -> Option<CubeKey>;
}

/// In-memory `CubeStore` for this crate's own tests. Cube "parsing" is
/// trivial: the raw bytes themselves already encode a `CubeMeta`-compatible
/// header in test fixtures built via `TestCube`.
pub struct InMemoryCubeStore {
    cubes: Mutex<HashMap<CubeKey, CubeInfo>>,
    notify_index: Mutex<HashMap<NotificationKey, Vec<CubeKey>>>,
    order: Mutex<Vec<CubeKey>>,
    events: broadcast::Sender<CubeInfo>,
}

impl InMemoryCubeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            cubes: Mutex::new(HashMap::new()),
            notify_index: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Directly insert a cube (test helper bypassing raw-byte parsing),
    /// applying the cube contest if one is already stored.
    pub fn insert(&self, info: CubeInfo, notify: Option<NotificationKey>) -> Option<CubeInfo> {
        let mut cubes = self.cubes.lock().unwrap();
        let winner = match cubes.get(&info.meta.key) {
            Some(existing) if existing.meta.cube_type.is_mutable() => {
                cube_contest(existing, &info).clone()
            }
            Some(existing) => existing.clone(),
            None => info.clone(),
        };
        let changed = cubes.get(&info.meta.key) != Some(&winner);
        cubes.insert(info.meta.key, winner.clone());
        drop(cubes);

        if !self.order.lock().unwrap().contains(&info.meta.key) {
            self.order.lock().unwrap().push(info.meta.key);
        }
        if let Some(n) = notify {
            let mut idx = self.notify_index.lock().unwrap();
            let list = idx.entry(n).or_default();
            if !list.contains(&info.meta.key) {
                list.push(info.meta.key);
            }
        }
        if changed {
            let _ = self.events.send(winner.clone());
            Some(winner)
        } else {
            None
        }
    }
}

impl Default for InMemoryCubeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CubeStore for InMemoryCubeStore {
    async fn has_cube(&self, key: CubeKey) -> bool {
        self.cubes.lock().unwrap().contains_key(&key)
    }

    async fn get_cube_info(&self, key: CubeKey) -> Option<CubeInfo> {
        self.cubes.lock().unwrap().get(&key).cloned()
    }

    async fn get_cube(&self, key: CubeKey) -> Option<Vec<u8>> {
        self.cubes.lock().unwrap().get(&key).map(|c| c.raw.clone())
    }

    async fn add_cube(&self, raw: Vec<u8>) -> Result<Option<CubeInfo>, String> {
        let info = decode_test_cube(&raw).ok_or_else(|| "malformed test cube".to_string())?;
        Ok(self.insert(info, None))
    }

    async fn get_notifications(&self, recipient: NotificationKey) -> Vec<CubeInfo> {
        let idx = self.notify_index.lock().unwrap();
        let cubes = self.cubes.lock().unwrap();
        idx.get(&recipient)
            .into_iter()
            .flatten()
            .filter_map(|k| cubes.get(k).cloned())
            .collect()
    }

    async fn get_key_at_position(&self, position: u64) -> Option<CubeKey> {
        self.order.lock().unwrap().get(position as usize).copied()
    }

    fn subscribe_cube_added(&self) -> broadcast::Receiver<CubeInfo> {
        self.events.subscribe()
    }

    fn peek_cube_key(&self, raw: &[u8]) -> Option<CubeKey> {
        decode_test_cube(raw).map(|info| info.meta.key)
    }
}

/// Minimal fixed-layout test cube used only by this crate's tests:
/// `key[32] || cube_type[1] || difficulty[1] || date[8 BE] || update_count[8 BE] || payload`.
pub fn encode_test_cube(
    key: CubeKey,
    cube_type: CubeType,
    difficulty: u8,
    date: u64,
    update_count: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(50 + payload.len());
    buf.extend_from_slice(&key.0);
    buf.push(cube_type.to_wire());
    buf.push(difficulty);
    buf.extend_from_slice(&date.to_be_bytes());
    buf.extend_from_slice(&update_count.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_test_cube(raw: &[u8]) -> Option<CubeInfo> {
    if raw.len() < 50 {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw[0..32]);
    let cube_type = CubeType::from_wire(raw[32])?;
    let difficulty = raw[33];
    let date = u64::from_be_bytes(raw[34..42].try_into().ok()?);
    let update_count = u64::from_be_bytes(raw[42..50].try_into().ok()?);
    Some(CubeInfo {
        meta: CubeMeta {
            key: CubeKey::new(key),
            cube_type,
            difficulty,
            date,
        },
        update_count,
        expiration: date.saturating_add(difficulty as u64 * 1000),
        raw: raw.to_vec(),
    })
}

pub fn test_epoch() -> u64 {
    now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(
        key: [u8; 32],
        ty: CubeType,
        date: u64,
        update_count: u64,
        expiration: u64,
    ) -> CubeInfo {
        CubeInfo {
            meta: CubeMeta {
                key: CubeKey::new(key),
                cube_type: ty,
                difficulty: 1,
                date,
            },
            update_count,
            expiration,
            raw: vec![],
        }
    }

    #[test]
    fn frozen_cubes_never_conflict() {
        let a = info([1; 32], CubeType::Frozen, 1, 0, 0);
        let b = info([1; 32], CubeType::Frozen, 2, 0, 0);
        assert_eq!(cube_contest(&a, &b), &a);
    }

    #[test]
    fn muc_newer_date_wins() {
        let v1 = info([1; 32], CubeType::Muc, 1_000_000_000, 0, 0);
        let v2 = info([1; 32], CubeType::Muc, 1_000_000_001, 0, 0);
        assert_eq!(cube_contest(&v1, &v2).meta.date, v2.meta.date);
        assert_eq!(cube_contest(&v2, &v1).meta.date, v2.meta.date);
    }

    #[test]
    fn pmuc_version_contest_from_scenario_3() {
        let v1 = info([1; 32], CubeType::Pmuc, 1_000_000_000, 1, 2_000_000_000);
        let v1_stale = info([1; 32], CubeType::Pmuc, 1_000_000, 1, 1_001_000);
        // stale v1' has same updatecount but lower expiration: v1 survives.
        assert_eq!(cube_contest(&v1, &v1_stale).update_count, 1);
        assert_eq!(cube_contest(&v1, &v1_stale).expiration, v1.expiration);

        let v2 = info([1; 32], CubeType::Pmuc, 1_000_000_002, 2, 3_000_000_000);
        assert_eq!(cube_contest(&v1, &v2).update_count, 2);

        let v3 = info([1; 32], CubeType::Pmuc, 1_000_000_003, 3, 4_000_000_000);
        assert_eq!(cube_contest(&v2, &v3).update_count, 3);

        let v3_later = info(
            [1; 32],
            CubeType::Pmuc,
            1_000_000_000_000,
            3,
            1_000_000_000_000,
        );
        assert_eq!(cube_contest(&v3, &v3_later).expiration, v3_later.expiration);
    }
}
