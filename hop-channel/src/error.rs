//! Error types for hop-channel

use thiserror::Error;

use crate::session::SessionId;

/// Result type alias for channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on packet channels and their transports
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("transport error: {0}")]
    Transport(String),

    /// The peer violated the framing or control protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single-chunk write larger than the stream's chunk limit
    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("packet of {0} bytes is too large")]
    PacketTooLarge(usize),

    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    /// Datagram position already seen or outside the replay window
    #[error("replayed datagram at position {position}")]
    Replay { position: u64 },

    #[error("invalid control message: {0}")]
    InvalidControlMessage(String),

    /// Another channel on the endpoint already serves this session
    #[error("session {0} already has a datagram channel on this endpoint")]
    SessionInUse(SessionId),

    #[error("remote endpoint not known yet")]
    NoRemoteEndpoint,
}

impl Error {
    /// The underlying connection or socket is unusable
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport(_) | Error::Protocol(_)
        )
    }

    /// Errors on inbound datagrams that are dropped without affecting the channel
    pub fn is_drop_silently(&self) -> bool {
        matches!(
            self,
            Error::Decryption(_) | Error::Replay { .. } | Error::PacketTooShort { .. }
        )
    }
}
