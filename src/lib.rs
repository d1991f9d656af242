//! cubeswarm: a peer-to-peer overlay for distributing fixed-size,
//! content-addressed binary objects ("cubes") among nodes.

pub mod net;

pub use net::{
    Address, CubeKey, CubeMeta, CubeType, NetConfig, NetworkError, NetworkManager, NetworkMessage,
    NetworkPeer, NetworkResult, NodeIdentity, NodeType, NotificationKey, Peer, PeerDb,
};
