//! Hop tunnel
//!
//! Session level plumbing on top of `hop-channel` and `hop-nat`: a
//! [`Tunnel`] keeps a paced, capped set of parallel packet channels for
//! one session, and a [`UdpRelayBridge`] connects a tunnel to a UDP
//! relay pool on the side that talks to real destinations.
//!
//! # Architecture
//!
//! ```text
//!   local packets                              inbound packets
//!        │                                            ▲
//!        ▼                                            │
//! ┌──────────────────────────────────────────────────────────┐
//! │ Tunnel                                                   │
//! │  - round-robin over open channels of the active protocol │
//! │  - paced growth up to min(local cap, peer cap)           │
//! │  - idle close / retirement / minimum upkeep              │
//! └───────┬──────────────────────┬───────────────────────────┘
//!         │ ChannelFactory       │ ChannelEvent queue
//!         ▼                      │
//! ┌────────────────┐   ┌─────────┴──────────┐
//! │ StreamChannel  │   │  DatagramChannel   │   hop-channel
//! │ (pooled conns) │   │  (shared endpoint) │
//! └────────────────┘   └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hop_channel::{transport::TcpConnector, ConnectionPool, SessionId};
//! use hop_tunnel::{Config, PooledChannelFactory, SessionParams, Tunnel};
//!
//! async fn run() -> hop_tunnel::Result<()> {
//!     let config = Config::load("hop.toml")?;
//!     let connector = Arc::new(TcpConnector::new("203.0.113.1:4096".parse().unwrap()));
//!     let pool = Arc::new(ConnectionPool::new(connector, config.pool_config()));
//!     let factory = PooledChannelFactory::new(config.channel_settings()).with_pool(pool);
//!
//!     let session = SessionParams { session_id: SessionId::random(), peer_max_channel_count: 4 };
//!     let (tunnel, mut inbound) = Tunnel::new(session, config.tunnel_config(), Arc::new(factory));
//!
//!     tunnel.send_packet(&[0x45, 0, 0, 20]).await?;
//!     while let Some(packet) = inbound.recv().await {
//!         // hand the packet to the local network stack
//!     }
//!     tunnel.close().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod factory;
pub mod tunnel;

pub use bridge::UdpRelayBridge;
pub use config::{ChannelProtocol, Config, PoolSection, RelayMode, RelaySection, TunnelSection};
pub use error::{Error, Result};
pub use event::{LoggingEventHandler, TunnelEvent, TunnelEventHandler, TunnelStats};
pub use factory::{ChannelFactory, ChannelSettings, DatagramRoute, PooledChannelFactory};
pub use tunnel::{SessionParams, Tunnel, TunnelConfig};
