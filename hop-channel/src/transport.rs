//! Transport seams for packet channels
//!
//! This module provides the async traits channels are built on, so the same
//! channel code runs over real sockets or in-memory test doubles.
//!
//! # Architecture
//!
//! - [`StreamConnector`]: opens connected byte streams for stream channels
//! - [`DatagramTransport`]: a shared datagram socket for datagram channels
//!
//! # Mock Implementations
//!
//! The [`mock`] module provides in-memory implementations for testing:
//! - [`mock::MockConnector`]: hands out in-memory duplex streams
//! - [`mock::MockDatagramSocket`]: a connected pair of fake UDP sockets
//!
//! # Example
//!
//! ```ignore
//! use hop_channel::transport::{StreamConnector, TcpConnector};
//! use hop_channel::ChunkStream;
//!
//! async fn open(connector: &TcpConnector) -> hop_channel::Result<()> {
//!     let mut stream = ChunkStream::new(connector.connect().await?);
//!     stream.write(b"hello").await?;
//!     stream.finish(true).await?;
//!     Ok(())
//! }
//! ```

pub mod mock;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::Result;

/// A connected bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased byte stream used by stream channels
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens new connections to the tunnel peer
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// Connects to a fixed TCP endpoint
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            nodelay: true,
        }
    }

    /// Enable or disable Nagle's algorithm on new connections (disabled by default)
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(self.nodelay)?;
        log::debug!("connected to {}", self.addr);
        Ok(Box::new(stream))
    }
}

/// Async datagram socket shared by the datagram channels of an endpoint
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Receive a datagram and its source address
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send a datagram to the given address
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(UdpSocket::send_to(self, buf, addr).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}
