use swarmshare_proto::PeerId;
use thiserror::Error;

use crate::config::ConfigError;
use crate::piece_store::StoreError;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("handshake error: {0}")]
    Handshake(#[from] swarmshare_proto::HandshakeError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("piece store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("no live connection to peer {0}")]
    PeerUnavailable(PeerId),
}

impl SwarmError {
    pub fn piece_out_of_range(index: u32, piece_count: usize) -> Self {
        Self::Protocol(format!("piece index {index} out of range (piece count {piece_count})"))
    }

    /// Store failures take the whole peer down; everything else only ends
    /// the connection it happened on.
    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Config(_))
    }

    /// True for errors that just mean the remote side went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
