//! Channel creation for a tunnel

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hop_channel::{
    ConnectionPool, DatagramChannelConfig, DatagramCryptor, DatagramEndpoint, EventSender,
    PacketChannel, StreamChannel, StreamChannelConfig, TransportKind,
};

use crate::error::{Error, Result};

/// Opens new channels on behalf of a [`Tunnel`](crate::Tunnel)
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open a channel of `kind` reporting to `events`
    async fn open_channel(&self, kind: TransportKind, events: EventSender) -> Result<PacketChannel>;

    /// Whether this factory can open channels of `kind` at all
    fn can_open(&self, kind: TransportKind) -> bool {
        let _ = kind;
        true
    }
}

/// Per-channel settings applied by a factory
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub stream_lifespan: Option<Duration>,
    pub datagram_lifespan: Option<Duration>,
    pub close_timeout: Duration,
    pub datagram_queue_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            stream_lifespan: None,
            datagram_lifespan: None,
            close_timeout: Duration::from_secs(3),
            datagram_queue_capacity: 1024,
        }
    }
}

/// Where a session's datagram channel lives
#[derive(Clone)]
pub struct DatagramRoute {
    pub endpoint: DatagramEndpoint,
    /// Shared by every datagram channel of the session
    pub cryptor: Arc<DatagramCryptor>,
    /// Peer address, known up front on the connecting side
    pub remote: Option<SocketAddr>,
}

/// Factory opening stream channels from a connection pool and the
/// datagram channel from a shared endpoint
///
/// A factory with neither configured opens nothing; tunnels using it
/// only carry channels handed to [`Tunnel::add_channel`](crate::Tunnel::add_channel).
#[derive(Default)]
pub struct PooledChannelFactory {
    pool: Option<Arc<ConnectionPool>>,
    datagram: Option<DatagramRoute>,
    settings: ChannelSettings,
}

impl PooledChannelFactory {
    pub fn new(settings: ChannelSettings) -> Self {
        Self {
            pool: None,
            datagram: None,
            settings,
        }
    }

    /// Open stream channels on connections from `pool`
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open datagram channels on `route`
    pub fn with_datagram(mut self, route: DatagramRoute) -> Self {
        self.datagram = Some(route);
        self
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }
}

#[async_trait]
impl ChannelFactory for PooledChannelFactory {
    async fn open_channel(&self, kind: TransportKind, events: EventSender) -> Result<PacketChannel> {
        match kind {
            TransportKind::Stream => {
                let pool = self
                    .pool
                    .as_ref()
                    .ok_or_else(|| Error::Config("stream channels are not configured".into()))?;
                let stream = pool.acquire().await?;
                let config = StreamChannelConfig {
                    lifespan: self.settings.stream_lifespan,
                    close_timeout: self.settings.close_timeout,
                    pool: Some(pool.clone()),
                };
                Ok(StreamChannel::new(stream, config, events).into())
            }
            TransportKind::Datagram => {
                let route = self
                    .datagram
                    .as_ref()
                    .ok_or_else(|| Error::Config("datagram channels are not configured".into()))?;
                let config = DatagramChannelConfig {
                    lifespan: self.settings.datagram_lifespan,
                    remote: route.remote,
                    queue_capacity: self.settings.datagram_queue_capacity,
                    close_timeout: self.settings.close_timeout,
                };
                let channel = route
                    .endpoint
                    .open_channel(route.cryptor.clone(), config, events)?;
                Ok(channel.into())
            }
        }
    }

    fn can_open(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Stream => self.pool.is_some(),
            TransportKind::Datagram => self.datagram.is_some(),
        }
    }
}
