//! Error types for hop-nat

use std::io;
use thiserror::Error;

use crate::flow::{FlowProtocol, IpVersion};

/// Result type alias for hop-nat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tracking or relaying flows
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a relay socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Every NAT id in the namespace is in use
    #[error("NAT table overflow: no free id for {protocol}/{ip_version}")]
    Overflow {
        ip_version: IpVersion,
        protocol: FlowProtocol,
    },

    /// The flow already holds a NAT id
    #[error("flow already mapped: {0}")]
    Duplicate(String),

    /// Packet could not be parsed
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// IP protocol number that the table does not track
    #[error("unsupported IP protocol: {0}")]
    UnsupportedProtocol(u8),

    /// The relay pool refused to create another worker
    #[error("relay worker limit reached ({0})")]
    WorkerLimit(usize),

    /// The relay pool has been closed
    #[error("relay pool closed")]
    Closed,
}

impl Error {
    /// Check if the error means the id space is exhausted
    pub fn is_overflow(&self) -> bool {
        matches!(self, Error::Overflow { .. })
    }
}
