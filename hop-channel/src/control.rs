//! In-band control messages
//!
//! Control messages travel as ordinary payloads on a channel. An IP packet
//! never starts with `0xFE` (its first nibble is the IP version), so a
//! payload starting with the marker is unambiguous.
//!
//! ```text
//! +--------+--------+------------------+
//! | 0xFE   | kind   | body             |
//! +--------+--------+------------------+
//! ```

use crate::error::{Error, Result};

pub const CONTROL_MARKER: u8 = 0xFE;

const KIND_CLOSE_CHANNEL: u8 = 0x01;

/// Why a channel is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseCause {
    Shutdown = 0,
    Idle = 1,
    Retired = 2,
}

impl TryFrom<u8> for CloseCause {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CloseCause::Shutdown),
            1 => Ok(CloseCause::Idle),
            2 => Ok(CloseCause::Retired),
            other => Err(Error::InvalidControlMessage(format!(
                "unknown close cause {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// The sender is closing this channel
    CloseChannel(CloseCause),
}

impl ControlMessage {
    pub fn close(cause: CloseCause) -> Self {
        ControlMessage::CloseChannel(cause)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::CloseChannel(cause) => {
                vec![CONTROL_MARKER, KIND_CLOSE_CHANNEL, *cause as u8]
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match data {
            [CONTROL_MARKER, KIND_CLOSE_CHANNEL, cause] => {
                Ok(ControlMessage::CloseChannel(CloseCause::try_from(*cause)?))
            }
            [CONTROL_MARKER, KIND_CLOSE_CHANNEL, ..] => Err(Error::InvalidControlMessage(format!(
                "close message of {} bytes",
                data.len()
            ))),
            [CONTROL_MARKER, kind, ..] => Err(Error::InvalidControlMessage(format!(
                "unknown kind 0x{:02X}",
                kind
            ))),
            _ => Err(Error::InvalidControlMessage("missing control marker".into())),
        }
    }
}

/// Whether a channel payload is a control message rather than a packet
pub fn is_control_message(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[0] == CONTROL_MARKER
}
