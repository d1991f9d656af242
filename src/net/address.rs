//! Dialable addresses, tagged by transport kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dialable endpoint. Equality is value-based, not identity-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    WebSocket {
        host: String,
        port: u16,
    },
    /// Opaque multiaddress bytes for the multiplexed transport.
    Multiaddress(Vec<u8>),
}

impl Address {
    pub fn websocket(host: impl Into<String>, port: u16) -> Self {
        Address::WebSocket {
            host: host.into(),
            port,
        }
    }

    /// The wire `addressType` tag used in `MyServerAddress`/`PeerResponse`.
    pub fn type_tag(&self) -> u8 {
        match self {
            Address::WebSocket { .. } => 0,
            Address::Multiaddress(_) => 1,
        }
    }

    /// Whether this is a wildcard bind address (e.g. `0.0.0.0` or `[::]`)
    /// that should be rewritten to the peer's observed remote address.
    pub fn is_wildcard(&self) -> bool {
        match self {
            Address::WebSocket { host, .. } => host == "0.0.0.0" || host == "::" || host == "[::]",
            Address::Multiaddress(_) => false,
        }
    }

    /// Parse the ASCII wire representation produced by `to_wire_string`.
    pub fn from_wire_string(tag: u8, s: &str) -> Option<Self> {
        match tag {
            0 => {
                let (host, port) = s.rsplit_once(':')?;
                Some(Address::websocket(host.to_string(), port.parse().ok()?))
            }
            1 => Some(Address::Multiaddress(s.as_bytes().to_vec())),
            _ => None,
        }
    }

    pub fn to_wire_string(&self) -> String {
        match self {
            Address::WebSocket { host, port } => format!("{host}:{port}"),
            Address::Multiaddress(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::WebSocket { host, port } => write!(f, "ws://{host}:{port}"),
            Address::Multiaddress(bytes) => write!(f, "multiaddr:{}", hex_string(bytes)),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_round_trips_through_wire_string() {
        let addr = Address::websocket("example.org", 3021);
        let s = addr.to_wire_string();
        let parsed = Address::from_wire_string(addr.type_tag(), &s).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn wildcard_detection() {
        assert!(Address::websocket("0.0.0.0", 1234).is_wildcard());
        assert!(Address::websocket("::", 1234).is_wildcard());
        assert!(!Address::websocket("192.168.1.1", 1234).is_wildcard());
    }
}
