//! Error types for the tunnel

use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel or transport error
    #[error("channel error: {0}")]
    Channel(#[from] hop_channel::Error),

    /// Flow table or relay error
    #[error("NAT error: {0}")]
    Nat(#[from] hop_nat::Error),

    /// No open channel could carry the packet and none could be opened
    #[error("no channel available")]
    NoChannelAvailable,

    /// The tunnel has been closed
    #[error("tunnel is closed")]
    Closed,
}

impl Error {
    /// Check if the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::NoChannelAvailable => true,
            Error::Channel(e) => e.is_transport_failure() || matches!(e, hop_channel::Error::ChannelClosed),
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
