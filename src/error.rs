//! Error type for the host layer.

use thiserror::Error;

use crate::multiaddr::{Multiaddr, MultiaddrError};
use crate::peer::PeerId;
use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no enabled transport can dial {0}")]
    UnsupportedAddress(Multiaddr),

    #[error("peer {0} has no dialable address")]
    NoAddresses(PeerId),

    #[error("not connected to peer {0}")]
    NotConnected(PeerId),

    #[error("remote identity mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("unusable peer certificate: {0}")]
    Certificate(String),

    #[error("protocol {0} refused by remote")]
    ProtocolRefused(String),

    #[error("host setup failed: {0}")]
    Setup(String),

    #[error("host is closed")]
    Closed,

    #[error(transparent)]
    Address(#[from] MultiaddrError),

    #[error("stream negotiation failed: {0}")]
    Wire(#[from] WireError),

    #[error("QUIC connect failed: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    #[error("QUIC connection failed: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
