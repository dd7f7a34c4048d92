//! Error types for hexchain-protocols.

use std::time::Duration;

use hexchain_core::Hash;
use thiserror::Error;

use crate::peer::{PeerId, PeerState};

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Why a pending request failed. Every request resolves exactly once,
/// either with a response or with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out")]
    TimedOut,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("too many requests in flight")]
    TooManyRequests,

    #[error("response does not match the request")]
    UnexpectedResponse,
}

/// Errors that end a peer connection or fail a protocol call. None of them
/// are fatal to the node.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown message code {0:#04x}")]
    UnknownMessageCode(u8),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: u64, max: u32 },

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("no status within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("expected {expected} message, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkMismatch { ours: u64, theirs: u64 },

    #[error("genesis mismatch: ours {ours}, theirs {theirs}")]
    GenesisMismatch { ours: Hash, theirs: Hash },

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("illegal peer transition {from:?} -> {to:?}")]
    InvalidTransition { from: PeerState, to: PeerState },

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("outbound queue to {0} is full")]
    OutboundFull(PeerId),

    #[error("protocol is shutting down")]
    ShuttingDown,

    #[error("request failed: {0}")]
    Request(#[from] RequestError),
}

impl NetworkError {
    /// True for failures caused by the bytes a peer sent.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::Codec(_)
                | NetworkError::UnknownMessageCode(_)
                | NetworkError::EmptyFrame
                | NetworkError::FrameTooLarge { .. }
        )
    }

    /// True for failures that refuse a peer during the handshake.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::HandshakeTimeout(_)
                | NetworkError::NetworkMismatch { .. }
                | NetworkError::GenesisMismatch { .. }
                | NetworkError::VersionMismatch { .. }
                | NetworkError::UnexpectedMessage { .. }
        )
    }
}
