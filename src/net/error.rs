//! Error taxonomy for the networking and cube-retrieval core.

use crate::net::types::CubeKey;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced across connection handling, message dispatch, and the
/// request scheduler. Variants map 1:1 onto the taxonomy in the design doc.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("malformed frame from {0:?}: {1}")]
    Parse(Option<SocketAddr>, String),

    #[error("protocol violation from {0:?}: {1}")]
    ProtocolViolation(Option<SocketAddr>, String),

    #[error("transport error on {0:?}: {1}")]
    Transport(Option<SocketAddr>, String),

    #[error("request for {0:?} timed out")]
    Timeout(Option<CubeKey>),

    #[error("request cancelled")]
    Cancelled,

    #[error("cube rejected by policy: {0}")]
    PolicyReject(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
