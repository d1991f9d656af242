//! Binary wire codec for `NetworkMessage` (§4.2).
//!
//! Every frame is `u8 protocolVersion || u8 messageClass || payload`, all
//! integers big-endian. This is a hand-rolled codec, not a generic serde
//! derive: the layout is a normative external contract (§6), and a derive
//! macro can't express the per-class optional trailing fields or the
//! `MAX_CUBES_PER_MESSAGE` truncation-on-encode-and-decode rule from §8.

use crate::net::address::Address;
use crate::net::error::NetworkError;
use crate::net::types::NodeIdentity;
use crate::net::types::{
    CUBE_KEY_SIZE, CUBE_SIZE, CubeKey, CubeMeta, CubeType, HASH_SIZE, KeyRequestMode,
    MAX_ADDRESS_STRING_LEN, MAX_CUBES_PER_MESSAGE, NOTIFY_SIZE, NotificationKey, PROTOCOL_VERSION,
};

/// Response codes for subscription confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionResponseCode {
    Confirmed,
    Rejected,
}

impl SubscriptionResponseCode {
    fn to_wire(self) -> u8 {
        match self {
            SubscriptionResponseCode::Confirmed => 0,
            SubscriptionResponseCode::Rejected => 1,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(SubscriptionResponseCode::Confirmed),
            1 => Some(SubscriptionResponseCode::Rejected),
            _ => None,
        }
    }
}

/// A subscription confirmation payload shape (§9: "single canonical layout").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfirmationPayload {
    pub code: SubscriptionResponseCode,
    pub requested_key_blob: [u8; HASH_SIZE],
    pub cubes_hash_blob: Option<[u8; HASH_SIZE]>,
    pub duration_secs: Option<u16>,
}

/// One of the eight wire message classes.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Hello {
        peer_id: NodeIdentity,
        node_type: Option<u8>,
    },
    KeyRequest {
        mode: KeyRequestMode,
        count: u32,
        start_key: CubeKey,
        notify_key: Option<NotificationKey>,
        min_difficulty: Option<u8>,
        time_min: Option<u64>,
        time_max: Option<u64>,
    },
    KeyResponse {
        mode: KeyRequestMode,
        metas: Vec<CubeMeta>,
    },
    CubeRequest {
        keys: Vec<CubeKey>,
    },
    CubeResponse {
        cubes: Vec<Vec<u8>>,
    },
    MyServerAddress {
        address: Address,
    },
    PeerRequest,
    PeerResponse {
        addresses: Vec<Address>,
    },
    SubscribeCube {
        keys: Vec<CubeKey>,
    },
    SubscribeNotifications {
        recipients: Vec<NotificationKey>,
    },
    SubscriptionConfirmation(SubscriptionConfirmationPayload),
}

const CLASS_HELLO: u8 = 0;
const CLASS_KEY_REQUEST: u8 = 1;
const CLASS_KEY_RESPONSE: u8 = 2;
const CLASS_CUBE_REQUEST: u8 = 3;
const CLASS_CUBE_RESPONSE: u8 = 4;
const CLASS_MY_SERVER_ADDRESS: u8 = 5;
const CLASS_PEER_REQUEST: u8 = 6;
const CLASS_PEER_RESPONSE: u8 = 7;
const CLASS_SUBSCRIBE_CUBE: u8 = 8;
const CLASS_SUBSCRIBE_NOTIFICATIONS: u8 = 9;
const CLASS_SUBSCRIPTION_CONFIRMATION: u8 = 10;

/// Time fields in `KeyRequest` are serialized as 5 big-endian bytes (§4.2).
fn write_u40(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes()[3..8]);
}

fn read_u40(buf: &[u8], pos: &mut usize) -> Result<u64, NetworkError> {
    let bytes = read_slice(buf, pos, 5)?;
    let mut full = [0u8; 8];
    full[3..8].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(full))
}

fn read_slice<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], NetworkError> {
    if *pos + len > buf.len() {
        return Err(NetworkError::Parse(None, "frame truncated".to_string()));
    }
    let out = &buf[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, NetworkError> {
    Ok(read_slice(buf, pos, 1)?[0])
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, NetworkError> {
    Ok(u16::from_be_bytes(
        read_slice(buf, pos, 2)?.try_into().unwrap(),
    ))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, NetworkError> {
    Ok(u32::from_be_bytes(
        read_slice(buf, pos, 4)?.try_into().unwrap(),
    ))
}

fn read_key(buf: &[u8], pos: &mut usize) -> Result<[u8; CUBE_KEY_SIZE], NetworkError> {
    Ok(read_slice(buf, pos, CUBE_KEY_SIZE)?.try_into().unwrap())
}

fn write_addr(buf: &mut Vec<u8>, addr: &Address) {
    let s = addr.to_wire_string();
    let bytes = s.as_bytes();
    let len = bytes.len().min(MAX_ADDRESS_STRING_LEN);
    buf.push(addr.type_tag());
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len]);
}

fn read_addr(buf: &[u8], pos: &mut usize) -> Result<Address, NetworkError> {
    let tag = read_u8(buf, pos)?;
    let len = read_u16(buf, pos)? as usize;
    let bytes = read_slice(buf, pos, len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| NetworkError::Parse(None, "non-ASCII address".to_string()))?;
    Address::from_wire_string(tag, s)
        .ok_or_else(|| NetworkError::Parse(None, "bad address".to_string()))
}

impl NetworkMessage {
    pub fn class(&self) -> u8 {
        match self {
            NetworkMessage::Hello { .. } => CLASS_HELLO,
            NetworkMessage::KeyRequest { .. } => CLASS_KEY_REQUEST,
            NetworkMessage::KeyResponse { .. } => CLASS_KEY_RESPONSE,
            NetworkMessage::CubeRequest { .. } => CLASS_CUBE_REQUEST,
            NetworkMessage::CubeResponse { .. } => CLASS_CUBE_RESPONSE,
            NetworkMessage::MyServerAddress { .. } => CLASS_MY_SERVER_ADDRESS,
            NetworkMessage::PeerRequest => CLASS_PEER_REQUEST,
            NetworkMessage::PeerResponse { .. } => CLASS_PEER_RESPONSE,
            NetworkMessage::SubscribeCube { .. } => CLASS_SUBSCRIBE_CUBE,
            NetworkMessage::SubscribeNotifications { .. } => CLASS_SUBSCRIBE_NOTIFICATIONS,
            NetworkMessage::SubscriptionConfirmation(_) => CLASS_SUBSCRIPTION_CONFIRMATION,
        }
    }

    /// Encode this message as a complete wire frame, including the
    /// `protocolVersion || messageClass` header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.class());
        self.encode_payload(&mut buf);
        buf
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            NetworkMessage::Hello { peer_id, node_type } => {
                buf.extend_from_slice(&peer_id.0);
                if let Some(nt) = node_type {
                    buf.push(*nt);
                }
            }
            NetworkMessage::KeyRequest {
                mode,
                count,
                start_key,
                notify_key,
                min_difficulty,
                time_min,
                time_max,
            } => {
                buf.push(mode.to_wire());
                buf.extend_from_slice(&count.to_be_bytes());
                buf.extend_from_slice(&start_key.0);
                if let Some(nk) = notify_key {
                    buf.extend_from_slice(&nk.0);
                }
                if let Some(d) = min_difficulty {
                    buf.push(*d);
                }
                if let Some(t) = time_min {
                    write_u40(buf, *t);
                }
                if let Some(t) = time_max {
                    write_u40(buf, *t);
                }
            }
            NetworkMessage::KeyResponse { mode, metas } => {
                let capped = truncate_metas(metas);
                buf.push(mode.to_wire());
                buf.extend_from_slice(&(capped.len() as u32).to_be_bytes());
                for m in capped {
                    buf.push(m.cube_type.to_wire());
                    buf.push(m.difficulty);
                    write_u40(buf, m.date);
                    buf.extend_from_slice(&m.key.0);
                }
            }
            NetworkMessage::CubeRequest { keys } => {
                let capped = truncate_keys(keys);
                buf.extend_from_slice(&(capped.len() as u16).to_be_bytes());
                for k in capped {
                    buf.extend_from_slice(&k.0);
                }
            }
            NetworkMessage::CubeResponse { cubes } => {
                let capped = truncate_cubes(cubes);
                buf.extend_from_slice(&(capped.len() as u16).to_be_bytes());
                for c in capped {
                    let mut fixed = vec![0u8; CUBE_SIZE];
                    let n = c.len().min(CUBE_SIZE);
                    fixed[..n].copy_from_slice(&c[..n]);
                    buf.extend_from_slice(&fixed);
                }
            }
            NetworkMessage::MyServerAddress { address } => write_addr(buf, address),
            NetworkMessage::PeerRequest => {}
            NetworkMessage::PeerResponse { addresses } => {
                let capped = &addresses[..addresses.len().min(u16::MAX as usize)];
                buf.extend_from_slice(&(capped.len() as u16).to_be_bytes());
                for a in capped {
                    write_addr(buf, a);
                }
            }
            NetworkMessage::SubscribeCube { keys } => {
                let capped = truncate_keys(keys);
                buf.extend_from_slice(&(capped.len() as u16).to_be_bytes());
                for k in capped {
                    buf.extend_from_slice(&k.0);
                }
            }
            NetworkMessage::SubscribeNotifications { recipients } => {
                let capped = &recipients[..recipients.len().min(MAX_CUBES_PER_MESSAGE)];
                buf.extend_from_slice(&(capped.len() as u16).to_be_bytes());
                for r in capped {
                    buf.extend_from_slice(&r.0);
                }
            }
            NetworkMessage::SubscriptionConfirmation(p) => {
                buf.push(p.code.to_wire());
                buf.extend_from_slice(&p.requested_key_blob);
                buf.push(u8::from(p.cubes_hash_blob.is_some()));
                if let Some(h) = p.cubes_hash_blob {
                    buf.extend_from_slice(&h);
                }
                buf.push(u8::from(p.duration_secs.is_some()));
                if let Some(d) = p.duration_secs {
                    buf.extend_from_slice(&d.to_be_bytes());
                }
            }
        }
    }

    /// Decode a complete wire frame (including header) into a message.
    pub fn decode(buf: &[u8]) -> Result<Self, NetworkError> {
        let mut pos = 0usize;
        let version = read_u8(buf, &mut pos)?;
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::Parse(
                None,
                format!("unsupported protocol version {version}"),
            ));
        }
        let class = read_u8(buf, &mut pos)?;
        let msg = match class {
            CLASS_HELLO => {
                let peer_id = NodeIdentity(read_slice(buf, &mut pos, 16)?.try_into().unwrap());
                let node_type = if pos < buf.len() {
                    Some(read_u8(buf, &mut pos)?)
                } else {
                    None
                };
                NetworkMessage::Hello { peer_id, node_type }
            }
            CLASS_KEY_REQUEST => {
                let mode = KeyRequestMode::from_wire(read_u8(buf, &mut pos)?)
                    .ok_or_else(|| NetworkError::Parse(None, "bad KeyRequest mode".to_string()))?;
                let count = read_u32(buf, &mut pos)?;
                let start_key = CubeKey::new(read_key(buf, &mut pos)?);
                let remaining = buf.len() - pos;
                let (notify_key, min_difficulty, time_min, time_max) = match mode {
                    KeyRequestMode::NotificationChallenge if remaining > NOTIFY_SIZE => {
                        let nk = NotificationKey::new(read_key(buf, &mut pos)?);
                        let d = read_u8(buf, &mut pos)?;
                        (Some(nk), Some(d), None, None)
                    }
                    KeyRequestMode::NotificationTimestamp if remaining >= NOTIFY_SIZE + 10 => {
                        let nk = NotificationKey::new(read_key(buf, &mut pos)?);
                        let tmin = read_u40(buf, &mut pos)?;
                        let tmax = read_u40(buf, &mut pos)?;
                        (Some(nk), None, Some(tmin), Some(tmax))
                    }
                    _ => (None, None, None, None),
                };
                NetworkMessage::KeyRequest {
                    mode,
                    count,
                    start_key,
                    notify_key,
                    min_difficulty,
                    time_min,
                    time_max,
                }
            }
            CLASS_KEY_RESPONSE => {
                let mode = KeyRequestMode::from_wire(read_u8(buf, &mut pos)?)
                    .ok_or_else(|| NetworkError::Parse(None, "bad KeyResponse mode".to_string()))?;
                let count = read_u32(buf, &mut pos)? as usize;
                let count = count.min(MAX_CUBES_PER_MESSAGE);
                let mut metas = Vec::with_capacity(count);
                for _ in 0..count {
                    let cube_type = CubeType::from_wire(read_u8(buf, &mut pos)?)
                        .ok_or_else(|| NetworkError::Parse(None, "bad cube type".to_string()))?;
                    let difficulty = read_u8(buf, &mut pos)?;
                    let date = read_u40(buf, &mut pos)?;
                    let key = CubeKey::new(read_key(buf, &mut pos)?);
                    metas.push(CubeMeta {
                        key,
                        cube_type,
                        difficulty,
                        date,
                    });
                }
                NetworkMessage::KeyResponse { mode, metas }
            }
            CLASS_CUBE_REQUEST => {
                let count = (read_u16(buf, &mut pos)? as usize).min(MAX_CUBES_PER_MESSAGE);
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(CubeKey::new(read_key(buf, &mut pos)?));
                }
                NetworkMessage::CubeRequest { keys }
            }
            CLASS_CUBE_RESPONSE => {
                let count = (read_u16(buf, &mut pos)? as usize).min(MAX_CUBES_PER_MESSAGE);
                let mut cubes = Vec::with_capacity(count);
                for _ in 0..count {
                    cubes.push(read_slice(buf, &mut pos, CUBE_SIZE)?.to_vec());
                }
                NetworkMessage::CubeResponse { cubes }
            }
            CLASS_MY_SERVER_ADDRESS => NetworkMessage::MyServerAddress {
                address: read_addr(buf, &mut pos)?,
            },
            CLASS_PEER_REQUEST => NetworkMessage::PeerRequest,
            CLASS_PEER_RESPONSE => {
                let count = read_u16(buf, &mut pos)? as usize;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    addresses.push(read_addr(buf, &mut pos)?);
                }
                NetworkMessage::PeerResponse { addresses }
            }
            CLASS_SUBSCRIBE_CUBE => {
                let count = (read_u16(buf, &mut pos)? as usize).min(MAX_CUBES_PER_MESSAGE);
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(CubeKey::new(read_key(buf, &mut pos)?));
                }
                NetworkMessage::SubscribeCube { keys }
            }
            CLASS_SUBSCRIBE_NOTIFICATIONS => {
                let count = (read_u16(buf, &mut pos)? as usize).min(MAX_CUBES_PER_MESSAGE);
                let mut recipients = Vec::with_capacity(count);
                for _ in 0..count {
                    recipients.push(NotificationKey::new(read_key(buf, &mut pos)?));
                }
                NetworkMessage::SubscribeNotifications { recipients }
            }
            CLASS_SUBSCRIPTION_CONFIRMATION => {
                let code = SubscriptionResponseCode::from_wire(read_u8(buf, &mut pos)?)
                    .ok_or_else(|| {
                        NetworkError::Parse(None, "bad subscription code".to_string())
                    })?;
                let requested_key_blob = read_slice(buf, &mut pos, HASH_SIZE)?.try_into().unwrap();
                let has_hash = read_u8(buf, &mut pos)? != 0;
                let cubes_hash_blob = if has_hash {
                    Some(read_slice(buf, &mut pos, HASH_SIZE)?.try_into().unwrap())
                } else {
                    None
                };
                let has_duration = read_u8(buf, &mut pos)? != 0;
                let duration_secs = if has_duration {
                    Some(read_u16(buf, &mut pos)?)
                } else {
                    None
                };
                NetworkMessage::SubscriptionConfirmation(SubscriptionConfirmationPayload {
                    code,
                    requested_key_blob,
                    cubes_hash_blob,
                    duration_secs,
                })
            }
            other => {
                return Err(NetworkError::Parse(
                    None,
                    format!("unknown message class {other}"),
                ));
            }
        };
        Ok(msg)
    }
}

fn truncate_metas(metas: &[CubeMeta]) -> &[CubeMeta] {
    &metas[..metas.len().min(MAX_CUBES_PER_MESSAGE)]
}

fn truncate_keys(keys: &[CubeKey]) -> &[CubeKey] {
    &keys[..keys.len().min(MAX_CUBES_PER_MESSAGE)]
}

fn truncate_cubes(cubes: &[Vec<u8>]) -> &[Vec<u8>] {
    &cubes[..cubes.len().min(MAX_CUBES_PER_MESSAGE)]
}
