//! Datagram channel
//!
//! A [`DatagramEndpoint`] owns one datagram socket and routes inbound
//! datagrams to channels by the session id in their clear-text header.
//! Each [`DatagramChannel`] decrypts with its session's cryptor, learns the
//! peer's address from the first datagram that authenticates, and follows
//! it when it changes. Datagrams that fail to authenticate or replay an old
//! position are dropped without affecting the channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{check_packet_size, ChannelCore, ChannelId, CloseReason, EventSender, TransportKind};
use crate::control::{self, CloseCause, ControlMessage};
use crate::crypto::{peek_session_id, DatagramCryptor};
use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::transport::DatagramTransport;

const MAX_DATAGRAM_SIZE: usize = 65_535;

static NEXT_ROUTE_ID: AtomicU64 = AtomicU64::new(1);

type Inbound = (Vec<u8>, SocketAddr);

/// Datagram channel settings
#[derive(Debug, Clone)]
pub struct DatagramChannelConfig {
    /// Idle time after which the owner may close the channel
    pub lifespan: Option<Duration>,
    /// Where to send before the peer has been heard from
    pub remote: Option<SocketAddr>,
    /// Inbound datagrams buffered between the endpoint and the channel
    pub queue_capacity: usize,
    /// Bound on sending the close notice
    pub close_timeout: Duration,
}

impl Default for DatagramChannelConfig {
    fn default() -> Self {
        Self {
            lifespan: None,
            remote: None,
            queue_capacity: 1024,
            close_timeout: Duration::from_secs(3),
        }
    }
}

struct Route {
    id: u64,
    inbound: mpsc::Sender<Inbound>,
}

struct EndpointInner {
    transport: Arc<dyn DatagramTransport>,
    routes: DashMap<SessionId, Route>,
    unrouted: AtomicU64,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl EndpointInner {
    fn detach(&self, session_id: SessionId, route_id: u64) {
        self.routes
            .remove_if(&session_id, |_, route| route.id == route_id);
    }
}

/// Shared datagram socket demultiplexing sessions
#[derive(Clone)]
pub struct DatagramEndpoint {
    inner: Arc<EndpointInner>,
}

impl DatagramEndpoint {
    /// Start routing datagrams from `transport`. Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn DatagramTransport>) -> Self {
        let inner = Arc::new(EndpointInner {
            transport: transport.clone(),
            routes: DashMap::new(),
            unrouted: AtomicU64::new(0),
            recv_task: StdMutex::new(None),
        });

        let task = tokio::spawn(route_datagrams(transport, Arc::downgrade(&inner)));
        *inner.recv_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Self { inner }
    }

    /// Bind a UDP socket and start routing on it
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::info!("datagram endpoint listening on {}", socket.local_addr()?);
        Ok(Self::new(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Open the channel for the cryptor's session
    pub fn open_channel(
        &self,
        cryptor: Arc<DatagramCryptor>,
        config: DatagramChannelConfig,
        events: EventSender,
    ) -> Result<DatagramChannel> {
        let session_id = cryptor.session_id();
        let route_id = NEXT_ROUTE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        match self.inner.routes.entry(session_id) {
            Entry::Occupied(_) => return Err(Error::SessionInUse(session_id)),
            Entry::Vacant(slot) => {
                slot.insert(Route {
                    id: route_id,
                    inbound: tx,
                });
            }
        }

        let inner = Arc::new(DatagramInner {
            core: ChannelCore::new(TransportKind::Datagram, config.lifespan, events),
            cryptor,
            transport: self.inner.transport.clone(),
            endpoint: Arc::downgrade(&self.inner),
            route_id,
            remote: RwLock::new(config.remote),
            close_timeout: config.close_timeout,
            dropped: AtomicU64::new(0),
            inbound_task: StdMutex::new(None),
        });

        let task = tokio::spawn(receive_loop(inner.clone(), rx));
        *inner.inbound_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        log::debug!(
            "datagram channel {} opened for session {}",
            inner.core.id(),
            session_id
        );
        Ok(DatagramChannel { inner })
    }

    /// Sessions with an open channel on this endpoint
    pub fn session_count(&self) -> usize {
        self.inner.routes.len()
    }

    /// Datagrams that matched no session
    pub fn unrouted_count(&self) -> u64 {
        self.inner.unrouted.load(Ordering::Relaxed)
    }

    /// Stop receiving. Channels on this endpoint close as failed.
    pub fn close(&self) {
        if let Some(task) = self
            .inner
            .recv_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.inner.routes.clear();
    }
}

async fn route_datagrams(transport: Arc<dyn DatagramTransport>, endpoint: Weak<EndpointInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::error!("datagram endpoint receive failed: {}", e);
                break;
            }
        };

        let Some(endpoint) = endpoint.upgrade() else {
            return;
        };
        let datagram = &buf[..len];
        let route = peek_session_id(datagram)
            .and_then(|sid| endpoint.routes.get(&sid).map(|route| route.inbound.clone()));

        match route {
            Some(inbound) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send((datagram.to_vec(), from)) {
                    log::trace!("inbound queue full, dropping datagram from {}", from);
                }
            }
            None => {
                endpoint.unrouted.fetch_add(1, Ordering::Relaxed);
                log::trace!("unrouted datagram of {} bytes from {}", len, from);
            }
        }
    }

    // the socket is gone; detaching every route fails its channel
    if let Some(endpoint) = endpoint.upgrade() {
        endpoint.routes.clear();
    }
}

/// Packet channel over a shared datagram socket
#[derive(Clone)]
pub struct DatagramChannel {
    inner: Arc<DatagramInner>,
}

struct DatagramInner {
    core: ChannelCore,
    cryptor: Arc<DatagramCryptor>,
    transport: Arc<dyn DatagramTransport>,
    endpoint: Weak<EndpointInner>,
    route_id: u64,
    remote: RwLock<Option<SocketAddr>>,
    close_timeout: Duration,
    dropped: AtomicU64,
    inbound_task: StdMutex<Option<JoinHandle<()>>>,
}

impl DatagramChannel {
    pub fn id(&self) -> ChannelId {
        self.inner.core.id()
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.cryptor.session_id()
    }

    pub(super) fn core(&self) -> &ChannelCore {
        &self.inner.core
    }

    /// The peer address datagrams are currently sent to
    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote()
    }

    /// Inbound datagrams dropped for failing authentication or replay checks
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        check_packet_size(packet)?;
        self.inner.core.ensure_open()?;
        let _pending = self.inner.core.pending();
        self.inner.send_sealed(packet).await?;
        self.inner.core.record_sent(packet.len());
        Ok(())
    }

    pub async fn send_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        for packet in packets {
            self.send_packet(packet).await?;
        }
        Ok(())
    }

    pub(super) async fn shutdown(&self, cause: CloseCause, notify_peer: bool, reason: CloseReason) {
        let inner = &self.inner;
        if !inner.core.begin_close() {
            return;
        }

        if notify_peer {
            let notice = ControlMessage::close(cause).encode();
            match timeout(inner.close_timeout, inner.send_sealed(&notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("datagram channel {}: close notice failed: {}", inner.core.id(), e),
                Err(_) => log::debug!("datagram channel {}: close notice timed out", inner.core.id()),
            }
        }
        inner.teardown(reason, true);
    }
}

impl DatagramInner {
    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.read().unwrap_or_else(|e| e.into_inner())
    }

    fn learn_remote(&self, from: SocketAddr) {
        if self.remote() == Some(from) {
            return;
        }
        let mut remote = self.remote.write().unwrap_or_else(|e| e.into_inner());
        if *remote != Some(from) {
            log::info!(
                "session {} remote endpoint {:?} -> {}",
                self.cryptor.session_id(),
                *remote,
                from
            );
            *remote = Some(from);
        }
    }

    async fn send_sealed(&self, payload: &[u8]) -> Result<()> {
        let remote = self.remote().ok_or(Error::NoRemoteEndpoint)?;
        let datagram = self.cryptor.encrypt(payload)?;
        if let Err(e) = self.transport.send_to(&datagram, remote).await {
            if e.is_transport_failure() && self.core.begin_close() {
                self.teardown(CloseReason::Failed(e.to_string()), true);
            }
            return Err(e);
        }
        Ok(())
    }

    fn teardown(&self, reason: CloseReason, abort_receiver: bool) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.detach(self.cryptor.session_id(), self.route_id);
        }
        if abort_receiver {
            if let Some(task) = self
                .inbound_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                task.abort();
            }
        }
        self.core.finish_close(reason);
    }
}

async fn receive_loop(inner: Arc<DatagramInner>, mut inbound: mpsc::Receiver<Inbound>) {
    let id = inner.core.id();
    while let Some((datagram, from)) = inbound.recv().await {
        let payload = match inner.cryptor.decrypt(&datagram) {
            Ok((_, payload)) => payload,
            Err(e) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("datagram channel {}: dropped datagram from {}: {}", id, from, e);
                continue;
            }
        };
        inner.learn_remote(from);

        if control::is_control_message(&payload) {
            inner.core.touch();
            match ControlMessage::decode(&payload) {
                Ok(ControlMessage::CloseChannel(cause)) => {
                    log::debug!("datagram channel {}: peer closing ({:?})", id, cause);
                    if inner.core.begin_close() {
                        inner.teardown(CloseReason::Remote, false);
                    }
                    return;
                }
                Err(e) => log::debug!("datagram channel {}: {}", id, e),
            }
            continue;
        }

        inner.core.deliver(payload).await;
    }

    // the endpoint dropped our route
    if inner.core.begin_close() {
        inner.teardown(CloseReason::Failed("datagram endpoint closed".into()), false);
    }
}
