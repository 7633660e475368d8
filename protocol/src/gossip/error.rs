//! Error taxonomy for the gossip engine.
//!
//! Only [`StartupError`] is ever fatal. Everything else is contained at the
//! packet or peer where it happened: logged, counted, dropped.

use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::KeyError;

/// A packet or value that cannot be accepted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    #[error("malformed packet: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("envelope fields disagree with the payload they carry")]
    InconsistentEnvelope,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unrecognized value kind {0}")]
    UnrecognizedKind(u16),

    #[error("message carries no values")]
    Empty,

    #[error("message is not addressed to this node")]
    Misaddressed,
}

/// A send that could not complete. Never retried: the next timer cycle
/// produces fresh traffic.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("send to {0} timed out")]
    SendTimeout(SocketAddr),

    #[error("socket error talking to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Resource acquisition failures at startup. These abort the process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("cannot bind gossip socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot load signing key material: {0}")]
    KeyMaterial(#[from] KeyError),
}
