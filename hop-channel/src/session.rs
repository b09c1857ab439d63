//! Session identity shared by all channels of one tunnel

use std::fmt;

/// Session identifier
///
/// Carried in the clear at the front of every datagram so an endpoint can
/// route it to the right channel before decrypting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate a random session ID
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Convert to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Create from bytes (big-endian)
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SessionId> for u64 {
    fn from(sid: SessionId) -> Self {
        sid.0
    }
}

/// Which end of the session this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Client,
    Server,
}

impl PeerRole {
    pub fn peer(&self) -> Self {
        match self {
            PeerRole::Client => PeerRole::Server,
            PeerRole::Server => PeerRole::Client,
        }
    }

    /// Direction byte used in datagram nonces for traffic sent by this role
    pub(crate) const fn direction(&self) -> u8 {
        match self {
            PeerRole::Client => 0,
            PeerRole::Server => 1,
        }
    }
}
