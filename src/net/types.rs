// cubeswarm network layer — constants and core value types
//
// Grounded on the teacher crate's `net/types.rs`: one file holding every
// wire-format size limit and protocol constant, each documented with its
// default and why that default was picked.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// WIRE PROTOCOL CONSTANTS
// =============================================================================

/// Current binary wire protocol version, sent as the first byte of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed size of a cube's content-addressed or public key.
pub const CUBE_KEY_SIZE: usize = 32;

/// Fixed size of a notification recipient key.
pub const NOTIFY_SIZE: usize = 32;

/// Generic hash size used for subscription confirmation blobs.
pub const HASH_SIZE: usize = 32;

/// Fixed on-wire size of a cube payload.
pub const CUBE_SIZE: usize = 1024;

/// Cap on the number of cube records/keys carried in a single message.
/// Resolved per spec.md §9 open question (c): fixed at 256, matching the
/// default `KeyResponse`/`CubeResponse` batch size the retrieval scheduler
/// targets (see `scheduler.rs`).
pub const MAX_CUBES_PER_MESSAGE: usize = 256;

/// Cap on the number of peer addresses returned by a single `PeerResponse`.
pub const MAX_NODE_ADDRESS_COUNT: usize = 10;

/// Default size of the recent-keys window (`RecentKeysWindow`).
pub const DEFAULT_RECENT_KEY_WINDOW_SIZE: usize = 1000;

/// Bounds how large an ASCII address string may be in `MyServerAddress`/`PeerResponse`.
pub const MAX_ADDRESS_STRING_LEN: usize = 512;

// =============================================================================
// KEYS, IDENTITIES, METADATA
// =============================================================================

/// 32-byte content- or public-key address of a cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CubeKey(pub [u8; CUBE_KEY_SIZE]);

impl CubeKey {
    pub const fn new(bytes: [u8; CUBE_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CubeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// 32-byte recipient address used for notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey(pub [u8; NOTIFY_SIZE]);

impl NotificationKey {
    pub const fn new(bytes: [u8; NOTIFY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Opaque 16-byte node identity, freshly randomized at each process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity(pub [u8; 16]);

impl NodeIdentity {
    /// Generate a fresh random identity for this process.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Node role advertised in `Hello`. Absence on the wire means `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Full,
    Light,
    Unknown,
}

impl NodeType {
    pub fn to_wire(self) -> Option<u8> {
        match self {
            NodeType::Full => Some(1),
            NodeType::Light => Some(2),
            NodeType::Unknown => None,
        }
    }

    pub fn from_wire(v: Option<u8>) -> Self {
        match v {
            Some(1) => NodeType::Full,
            Some(2) => NodeType::Light,
            _ => NodeType::Unknown,
        }
    }

    pub fn is_full(self) -> bool {
        matches!(self, NodeType::Full)
    }
}

/// Cube flavor, carried in `CubeMeta` and used by the cube contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeType {
    /// Immutable; key is a content hash. Never conflicts.
    Frozen,
    /// Mutable User Cube; key is a public key, newer `date` wins.
    Muc,
    /// Per-version Mutable Cube; greater `updatecount` wins, ties by expiration.
    Pmuc,
}

impl CubeType {
    pub fn to_wire(self) -> u8 {
        match self {
            CubeType::Frozen => 0,
            CubeType::Muc => 1,
            CubeType::Pmuc => 2,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(CubeType::Frozen),
            1 => Some(CubeType::Muc),
            2 => Some(CubeType::Pmuc),
            _ => None,
        }
    }

    pub fn is_mutable(self) -> bool {
        !matches!(self, CubeType::Frozen)
    }
}

/// Compact cube record as exchanged in `KeyRequest`/`KeyResponse`.
///
/// For PMUC cubes `updatecount` and `expiration` are folded into `date`'s
/// 40-bit field by the store (difficulty/date derive expiration); the core
/// only needs `date` to order frozen/MUC cubes and defers PMUC ordering to
/// `cube_contest`, which receives the full `CubeInfo` from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeMeta {
    pub key: CubeKey,
    pub cube_type: CubeType,
    pub difficulty: u8,
    /// Seconds since epoch, truncated to 40 bits on the wire.
    pub date: u64,
}

/// Key-request modes, §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestMode {
    SlidingWindow,
    SequentialStoreSync,
    NotificationChallenge,
    NotificationTimestamp,
    ExpressSync,
}

impl KeyRequestMode {
    pub fn to_wire(self) -> u8 {
        match self {
            KeyRequestMode::SlidingWindow => 0,
            KeyRequestMode::SequentialStoreSync => 1,
            KeyRequestMode::NotificationChallenge => 2,
            KeyRequestMode::NotificationTimestamp => 3,
            KeyRequestMode::ExpressSync => 4,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(KeyRequestMode::SlidingWindow),
            1 => Some(KeyRequestMode::SequentialStoreSync),
            2 => Some(KeyRequestMode::NotificationChallenge),
            3 => Some(KeyRequestMode::NotificationTimestamp),
            4 => Some(KeyRequestMode::ExpressSync),
            _ => None,
        }
    }
}

/// Live session status, §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Handshaking,
    Online,
    Closing,
    Closed,
}

/// Current time in seconds since the Unix epoch.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
