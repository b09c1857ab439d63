//! Packet channels for the hop tunnel data plane
//!
//! A tunnel moves IP packets over several parallel channels. This crate
//! provides the channels and what they run on:
//!
//! - [`ChunkStream`]: length-prefixed chunk framing over any byte stream,
//!   with connection reuse across exchanges
//! - [`ConnectionPool`]: keeps cleanly finished connections for reuse
//! - [`StreamChannel`] / [`DatagramChannel`]: the two channel kinds, unified
//!   as [`PacketChannel`]
//! - [`DatagramEndpoint`]: one socket shared by the datagram channels of
//!   many sessions
//! - [`ControlMessage`]: in-band close notices
//! - [`DatagramCryptor`]: AES-256-GCM sealing with replay protection
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hop_channel::transport::mock::MockConnector;
//! use hop_channel::{ConnectionPool, PacketChannel, PoolConfig, StreamChannel, StreamChannelConfig};
//!
//! async fn example() -> hop_channel::Result<()> {
//!     let pool = Arc::new(ConnectionPool::new(Arc::new(MockConnector::echo()), PoolConfig::default()));
//!     let (events, mut rx) = tokio::sync::mpsc::channel(64);
//!
//!     let config = StreamChannelConfig { pool: Some(pool.clone()), ..Default::default() };
//!     let channel = PacketChannel::from(StreamChannel::new(pool.acquire().await?, config, events));
//!
//!     channel.send_packet(&[0x45, 0, 0, 20]).await?;
//!     let echoed = rx.recv().await;
//!     channel.close(true).await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod chunk;
pub mod control;
mod crypto;
mod error;
mod pool;
mod session;
pub mod transport;

pub use channel::{
    ChannelEvent, ChannelEventKind, ChannelId, ChannelState, CloseReason, DatagramChannel,
    DatagramChannelConfig, DatagramEndpoint, EventReceiver, EventSender, PacketChannel,
    StreamChannel, StreamChannelConfig, TrafficStats, TransportKind, MAX_PACKET_SIZE,
};
pub use chunk::{ChunkReader, ChunkStream, ChunkWriter, DEFAULT_MAX_CHUNK_SIZE};
pub use control::{CloseCause, ControlMessage};
pub use crypto::{peek_session_id, DatagramCryptor, SessionKey, DATAGRAM_HEADER_LEN, REPLAY_WINDOW};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, PoolConfig};
pub use session::{PeerRole, SessionId};
