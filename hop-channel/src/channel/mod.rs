//! Packet channels
//!
//! A packet channel carries whole IP packets between the two ends of a
//! tunnel. [`StreamChannel`] frames packets as chunks on a reliable
//! connection; [`DatagramChannel`] seals each packet into one datagram.
//! The tunnel holds both behind [`PacketChannel`].
//!
//! Channels report to their owner through a single [`ChannelEvent`] queue:
//! every inbound packet, and exactly one `Closed` event once the channel
//! has shut down for whatever reason.

mod datagram;
mod stream;

pub use datagram::{DatagramChannel, DatagramChannelConfig, DatagramEndpoint};
pub use stream::{StreamChannel, StreamChannelConfig};

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::control::CloseCause;
use crate::error::{Error, Result};

/// Largest packet a channel accepts
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport a channel runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Open,
            1 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

/// Why a channel closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side
    Local,
    /// The peer closed the channel
    Remote,
    /// Closed after exceeding its idle lifespan
    Idle,
    /// The transport failed
    Failed(String),
}

impl CloseReason {
    /// Whether the owner should treat the close as a fault
    pub fn is_unexpected(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::Idle => write!(f, "idle"),
            CloseReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug)]
pub enum ChannelEventKind {
    /// An inbound packet
    Packet(Vec<u8>),
    /// The channel has closed; sent exactly once
    Closed(CloseReason),
}

#[derive(Debug)]
pub struct ChannelEvent {
    pub channel_id: ChannelId,
    pub kind: ChannelEventKind,
}

pub type EventSender = mpsc::Sender<ChannelEvent>;
pub type EventReceiver = mpsc::Receiver<ChannelEvent>;

/// Per-channel traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

/// State shared by both channel kinds
pub(crate) struct ChannelCore {
    id: ChannelId,
    kind: TransportKind,
    lifespan: Option<Duration>,
    state: AtomicU8,
    created: Instant,
    // milliseconds since `created`
    last_activity: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    pending_sends: AtomicUsize,
    // set once, by the close that gets reported
    close_reason: Mutex<Option<CloseReason>>,
    events: EventSender,
    shutdown: watch::Sender<bool>,
}

impl ChannelCore {
    pub(crate) fn new(kind: TransportKind, lifespan: Option<Duration>, events: EventSender) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: ChannelId::next(),
            kind,
            lifespan,
            state: AtomicU8::new(ChannelState::Open as u8),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            pending_sends: AtomicUsize::new(0),
            close_reason: Mutex::new(None),
            events,
            shutdown,
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    /// Move Open -> Closing. Only the caller that wins performs the close.
    pub(crate) fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ChannelState::Open as u8,
                ChannelState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Wake everything waiting on this channel
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Move to Closed and report it once
    pub(crate) fn finish_close(&self, reason: CloseReason) {
        let first = {
            let mut slot = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                false
            } else {
                *slot = Some(reason.clone());
                true
            }
        };
        self.state.store(ChannelState::Closed as u8, Ordering::Release);
        self.signal_shutdown();
        if !first {
            return;
        }

        match &reason {
            CloseReason::Failed(_) => log::warn!("{} channel {} {}", self.kind, self.id, reason),
            _ => log::debug!("{} channel {} {}", self.kind, self.id, reason),
        }

        let event = ChannelEvent {
            channel_id: self.id,
            kind: ChannelEventKind::Closed(reason),
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Hand an inbound packet to the owner. Returns false if nobody listens.
    pub(crate) async fn deliver(&self, packet: Vec<u8>) -> bool {
        self.record_received(packet.len());
        let event = ChannelEvent {
            channel_id: self.id,
            kind: ChannelEventKind::Packet(packet),
        };
        self.events.send(event).await.is_ok()
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    pub(crate) fn traffic(&self) -> TrafficStats {
        TrafficStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn pending(&self) -> PendingSend<'_> {
        self.pending_sends.fetch_add(1, Ordering::AcqRel);
        PendingSend { core: self }
    }

    pub(crate) fn pending_sends(&self) -> usize {
        self.pending_sends.load(Ordering::Acquire)
    }
}

/// Counts a send in flight for as long as it lives
pub(crate) struct PendingSend<'a> {
    core: &'a ChannelCore,
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        self.core.pending_sends.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) fn check_packet_size(packet: &[u8]) -> Result<()> {
    if packet.len() > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(packet.len()));
    }
    Ok(())
}

/// A packet channel of either transport kind
#[derive(Clone)]
pub enum PacketChannel {
    Stream(StreamChannel),
    Datagram(DatagramChannel),
}

impl PacketChannel {
    fn core(&self) -> &ChannelCore {
        match self {
            PacketChannel::Stream(channel) => channel.core(),
            PacketChannel::Datagram(channel) => channel.core(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.core().id()
    }

    pub fn kind(&self) -> TransportKind {
        self.core().kind
    }

    pub fn state(&self) -> ChannelState {
        self.core().state()
    }

    pub fn is_open(&self) -> bool {
        self.core().is_open()
    }

    /// Idle time after which the channel may be closed, if any
    pub fn lifespan(&self) -> Option<Duration> {
        self.core().lifespan
    }

    /// Time since a packet last crossed the channel in either direction
    pub fn idle_for(&self) -> Duration {
        self.core().idle_for()
    }

    /// Idle for longer than its lifespan
    pub fn is_expired(&self) -> bool {
        self.core()
            .lifespan
            .is_some_and(|lifespan| self.idle_for() > lifespan)
    }

    /// A send is currently waiting on this channel
    pub fn is_busy(&self) -> bool {
        self.core().pending_sends() > 0
    }

    pub fn traffic(&self) -> TrafficStats {
        self.core().traffic()
    }

    /// Why the channel closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.core().close_reason()
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        match self {
            PacketChannel::Stream(channel) => channel.send_packet(packet).await,
            PacketChannel::Datagram(channel) => channel.send_packet(packet).await,
        }
    }

    pub async fn send_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        match self {
            PacketChannel::Stream(channel) => channel.send_packets(packets).await,
            PacketChannel::Datagram(channel) => channel.send_packets(packets).await,
        }
    }

    /// Close the channel. A graceful close tells the peer first.
    pub async fn close(&self, graceful: bool) {
        self.shutdown(CloseCause::Shutdown, graceful, CloseReason::Local)
            .await
    }

    /// Close gracefully because the channel outlived its lifespan
    pub async fn close_idle(&self) {
        self.shutdown(CloseCause::Idle, true, CloseReason::Idle).await
    }

    /// Close gracefully because the tunnel no longer uses this transport
    pub async fn retire(&self) {
        self.shutdown(CloseCause::Retired, true, CloseReason::Local)
            .await
    }

    async fn shutdown(&self, cause: CloseCause, notify_peer: bool, reason: CloseReason) {
        match self {
            PacketChannel::Stream(channel) => channel.shutdown(cause, notify_peer, reason).await,
            PacketChannel::Datagram(channel) => channel.shutdown(cause, notify_peer, reason).await,
        }
    }
}

impl fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketChannel")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl From<StreamChannel> for PacketChannel {
    fn from(channel: StreamChannel) -> Self {
        PacketChannel::Stream(channel)
    }
}

impl From<DatagramChannel> for PacketChannel {
    fn from(channel: DatagramChannel) -> Self {
        PacketChannel::Datagram(channel)
    }
}
