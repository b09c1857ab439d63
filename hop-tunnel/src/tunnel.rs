//! Multi-channel tunnel
//!
//! A [`Tunnel`] owns the channel set of one session. Outbound packets are
//! spread over the open channels of the active protocol; inbound packets
//! from every channel are merged into one queue.
//!
//! The set grows one channel at a time. The first channel of the active
//! protocol opens on demand; after that a new channel may open once
//! `min_spawn_interval` has passed if sends are queueing behind busy
//! channels, or once `max_spawn_interval` has passed otherwise. A
//! maintenance task closes channels that outlive their idle lifespan,
//! retires idle channels of the inactive protocol and keeps at least
//! `min_channel_count` channels of the active one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use hop_channel::{
    ChannelEventKind, ChannelId, ChannelState, CloseReason, EventReceiver, EventSender,
    PacketChannel, SessionId, TransportKind,
};

use crate::error::{Error, Result};
use crate::event::{LoggingEventHandler, TunnelCounters, TunnelEvent, TunnelEventHandler, TunnelStats};
use crate::factory::ChannelFactory;

/// Channels tried for one send before giving up
const MAX_SEND_ATTEMPTS: usize = 3;

/// Runtime tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local cap on parallel channels
    pub max_channel_count: usize,
    /// Channels of the active protocol kept open while idle
    pub min_channel_count: usize,
    /// Protocol for new channels
    pub protocol: TransportKind,
    pub min_spawn_interval: Duration,
    pub max_spawn_interval: Duration,
    pub maintenance_interval: Duration,
    /// Idle time before a channel of the inactive protocol is retired
    pub retire_idle: Duration,
    pub close_timeout: Duration,
    /// Capacity of the inbound packet queue
    pub packet_queue_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_channel_count: 8,
            min_channel_count: 1,
            protocol: TransportKind::Stream,
            min_spawn_interval: Duration::from_millis(200),
            max_spawn_interval: Duration::from_secs(2),
            maintenance_interval: Duration::from_millis(500),
            retire_idle: Duration::from_secs(5),
            close_timeout: Duration::from_secs(3),
            packet_queue_capacity: 1024,
        }
    }
}

/// Session parameters granted by the session authority
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub session_id: SessionId,
    /// Channel count the peer is willing to carry
    pub peer_max_channel_count: usize,
}

struct SpawnState {
    last_spawn: Option<Instant>,
}

enum Outbound<'a> {
    One(&'a [u8]),
    Batch(&'a [Vec<u8>]),
}

impl Outbound<'_> {
    async fn send_on(&self, channel: &PacketChannel) -> hop_channel::Result<()> {
        match self {
            Outbound::One(packet) => channel.send_packet(packet).await,
            Outbound::Batch(packets) => channel.send_packets(packets).await,
        }
    }

    fn record(&self, counters: &TunnelCounters) {
        match self {
            Outbound::One(packet) => counters.record_tx(packet.len()),
            Outbound::Batch(packets) => {
                for packet in packets.iter() {
                    counters.record_tx(packet.len());
                }
            }
        }
    }
}

struct TunnelInner {
    session_id: SessionId,
    config: TunnelConfig,
    max_channel_count: usize,
    factory: Arc<dyn ChannelFactory>,
    handler: Arc<dyn TunnelEventHandler>,
    channels: RwLock<BTreeMap<ChannelId, PacketChannel>>,
    active: RwLock<TransportKind>,
    cursor: AtomicUsize,
    // a send found every channel busy since the last spawn
    pressure: AtomicBool,
    spawn: Arc<Mutex<SpawnState>>,
    events: EventSender,
    counters: TunnelCounters,
    closed: AtomicBool,
}

impl TunnelInner {
    fn channels_read(&self) -> RwLockReadGuard<'_, BTreeMap<ChannelId, PacketChannel>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn channels_write(&self) -> RwLockWriteGuard<'_, BTreeMap<ChannelId, PacketChannel>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    fn active(&self) -> TransportKind {
        *self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Channels of `kind` a session may hold. The datagram endpoint routes
    /// by session id, so a session has at most one datagram channel.
    fn cap_for(&self, kind: TransportKind) -> usize {
        match kind {
            TransportKind::Stream => self.max_channel_count,
            TransportKind::Datagram => self.max_channel_count.min(1),
        }
    }

    /// Channels that have not finished closing
    fn live_count(&self, kind: Option<TransportKind>) -> usize {
        self.channels_read()
            .values()
            .filter(|c| c.state() != ChannelState::Closed)
            .filter(|c| kind.map_or(true, |k| c.kind() == k))
            .count()
    }

    fn has_room(&self, kind: TransportKind) -> bool {
        let channels = self.channels_read();
        let live = channels
            .values()
            .filter(|c| c.state() != ChannelState::Closed);
        let (mut total, mut of_kind) = (0, 0);
        for channel in live {
            total += 1;
            if channel.kind() == kind {
                of_kind += 1;
            }
        }
        total < self.max_channel_count && of_kind < self.cap_for(kind)
    }

    /// Pick an open channel, rotating across calls and preferring one
    /// without a send in flight
    fn pick(&self, kind: Option<TransportKind>) -> Option<PacketChannel> {
        let channels = self.channels_read();
        let open: Vec<&PacketChannel> = channels
            .values()
            .filter(|c| c.is_open() && kind.map_or(true, |k| c.kind() == k))
            .collect();
        if open.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..open.len() {
            let channel = open[(start + offset) % open.len()];
            if !channel.is_busy() {
                return Some(channel.clone());
            }
        }

        self.pressure.store(true, Ordering::Relaxed);
        Some(open[start % open.len()].clone())
    }

    async fn channel_for_send(self: &Arc<Self>) -> Result<PacketChannel> {
        let active = self.active();
        if let Some(channel) = self.pick(Some(active)) {
            return Ok(channel);
        }

        match self.open_on_demand(active).await {
            Ok(channel) => Ok(channel),
            // keep traffic moving on the previous protocol meanwhile
            Err(e) => self.pick(None).ok_or(e),
        }
    }

    async fn open_on_demand(self: &Arc<Self>, kind: TransportKind) -> Result<PacketChannel> {
        if !self.factory.can_open(kind) {
            return Err(Error::NoChannelAvailable);
        }

        let mut state = self.spawn.lock().await;
        self.ensure_open()?;
        if let Some(channel) = self.pick(Some(kind)) {
            return Ok(channel);
        }
        if !self.has_room(kind) {
            self.retire_one_other(kind).await;
        }
        self.open_locked(kind, &mut state).await
    }

    /// Free a slot held by a channel of another protocol
    async fn retire_one_other(&self, kind: TransportKind) {
        let victim = self
            .channels_read()
            .values()
            .filter(|c| c.is_open() && c.kind() != kind && !c.is_busy())
            .max_by_key(|c| c.idle_for())
            .cloned();

        if let Some(channel) = victim {
            log::debug!(
                "tunnel {}: retiring {} channel {} to make room",
                self.session_id,
                channel.kind(),
                channel.id()
            );
            channel.retire().await;
        }
    }

    async fn open_locked(&self, kind: TransportKind, state: &mut SpawnState) -> Result<PacketChannel> {
        if !self.has_room(kind) {
            return Err(Error::NoChannelAvailable);
        }

        state.last_spawn = Some(Instant::now());
        let channel = match self.factory.open_channel(kind, self.events.clone()).await {
            Ok(channel) => channel,
            Err(e) => {
                self.counters.record_open_failure();
                log::warn!("tunnel {}: failed to open {} channel: {}", self.session_id, kind, e);
                return Err(e);
            }
        };

        if self.is_closed() {
            channel.close(false).await;
            return Err(Error::Closed);
        }
        self.register(channel.clone()).await;
        Ok(channel)
    }

    async fn register(&self, channel: PacketChannel) {
        let (channel_id, kind) = (channel.id(), channel.kind());
        self.channels_write().insert(channel_id, channel);
        self.counters.record_opened();

        log::info!(
            "tunnel {}: {} channel {} added ({} live)",
            self.session_id,
            kind,
            channel_id,
            self.live_count(None)
        );
        self.handler
            .on_event(TunnelEvent::ChannelOpened { channel_id, kind })
            .await;
    }

    /// Start opening a channel in the background if pacing allows
    fn try_spawn(self: &Arc<Self>, kind: TransportKind, interval: Duration) {
        if self.is_closed() || !self.factory.can_open(kind) || !self.has_room(kind) {
            return;
        }
        let Ok(mut state) = self.spawn.clone().try_lock_owned() else {
            return;
        };
        if state.last_spawn.is_some_and(|at| at.elapsed() < interval) {
            return;
        }

        self.pressure.store(false, Ordering::Relaxed);
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.open_locked(kind, &mut state).await {
                log::debug!("tunnel {}: channel not opened: {}", inner.session_id, e);
            }
        });
    }

    fn maybe_grow(self: &Arc<Self>) {
        let interval = if self.pressure.load(Ordering::Relaxed) {
            self.config.min_spawn_interval
        } else {
            self.config.max_spawn_interval
        };
        self.try_spawn(self.active(), interval);
    }

    fn ensure_minimum(self: &Arc<Self>) {
        let kind = self.active();
        let minimum = self.config.min_channel_count.min(self.cap_for(kind));
        if self.live_count(Some(kind)) < minimum {
            self.try_spawn(kind, self.config.min_spawn_interval);
        }
    }

    /// Drop a closed channel from the set, reporting it once
    async fn forget(&self, channel_id: ChannelId, reason: CloseReason) {
        let removed = self.channels_write().remove(&channel_id);
        let Some(channel) = removed else {
            return;
        };

        let unexpected = reason.is_unexpected();
        self.counters.record_closed(unexpected);
        self.handler
            .on_event(TunnelEvent::ChannelClosed {
                channel_id,
                kind: channel.kind(),
                reason,
                unexpected,
            })
            .await;
    }

    async fn reap_closed(&self) {
        let closed: Vec<(ChannelId, CloseReason)> = self
            .channels_read()
            .values()
            .filter(|c| c.state() == ChannelState::Closed)
            .map(|c| (c.id(), c.close_reason().unwrap_or(CloseReason::Local)))
            .collect();

        for (channel_id, reason) in closed {
            self.forget(channel_id, reason).await;
        }
    }

    async fn maintain(self: &Arc<Self>) {
        self.reap_closed().await;

        let active = self.active();
        let open: Vec<PacketChannel> = self
            .channels_read()
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect();
        let mut active_count = open.iter().filter(|c| c.kind() == active).count();

        for channel in open {
            if channel.is_busy() {
                continue;
            }

            if channel.kind() == active {
                if channel.is_expired() && active_count > self.config.min_channel_count {
                    active_count -= 1;
                    log::debug!(
                        "tunnel {}: channel {} idle for {:?}",
                        self.session_id,
                        channel.id(),
                        channel.idle_for()
                    );
                    tokio::spawn(async move { channel.close_idle().await });
                }
            } else if channel.idle_for() >= self.config.retire_idle {
                log::info!(
                    "tunnel {}: retiring {} channel {}",
                    self.session_id,
                    channel.kind(),
                    channel.id()
                );
                tokio::spawn(async move { channel.retire().await });
            }
        }

        self.ensure_minimum();
    }
}

/// The channel set of one session
pub struct Tunnel {
    inner: Arc<TunnelInner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Tunnel {
    /// Create a tunnel that logs its events. Must be called from within a
    /// tokio runtime.
    ///
    /// Inbound packets from every channel arrive on the returned receiver.
    pub fn new(
        session: SessionParams,
        config: TunnelConfig,
        factory: Arc<dyn ChannelFactory>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        Self::with_handler(session, config, factory, Arc::new(LoggingEventHandler))
    }

    pub fn with_handler(
        session: SessionParams,
        config: TunnelConfig,
        factory: Arc<dyn ChannelFactory>,
        handler: Arc<dyn TunnelEventHandler>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let max_channel_count = config
            .max_channel_count
            .min(session.peer_max_channel_count)
            .max(1);
        let capacity = config.packet_queue_capacity.max(1);
        let (events, events_rx) = mpsc::channel(capacity);
        let (packets_tx, packets_rx) = mpsc::channel(capacity);
        let maintenance_interval = config.maintenance_interval.max(Duration::from_millis(1));

        log::info!(
            "tunnel {} started: up to {} channels, {} protocol",
            session.session_id,
            max_channel_count,
            config.protocol
        );

        let inner = Arc::new(TunnelInner {
            session_id: session.session_id,
            active: RwLock::new(config.protocol),
            config,
            max_channel_count,
            factory,
            handler,
            channels: RwLock::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
            pressure: AtomicBool::new(false),
            spawn: Arc::new(Mutex::new(SpawnState { last_spawn: None })),
            events,
            counters: TunnelCounters::new(),
            closed: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(dispatch_events(Arc::downgrade(&inner), events_rx, packets_tx));
        let maintenance = tokio::spawn(run_maintenance(Arc::downgrade(&inner), maintenance_interval));

        let tunnel = Self {
            inner,
            tasks: StdMutex::new(vec![maintenance, dispatcher]),
        };
        (tunnel, packets_rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Effective cap: the smaller of the local and the peer's limit
    pub fn max_channel_count(&self) -> usize {
        self.inner.max_channel_count
    }

    /// Channels that have not finished closing
    pub fn channel_count(&self) -> usize {
        self.inner.live_count(None)
    }

    pub fn channel_count_of(&self, kind: TransportKind) -> usize {
        self.inner.live_count(Some(kind))
    }

    /// Snapshot of the channel set
    pub fn channels(&self) -> Vec<PacketChannel> {
        self.inner.channels_read().values().cloned().collect()
    }

    pub fn active_protocol(&self) -> TransportKind {
        self.inner.active()
    }

    /// Open new channels with `kind` from now on. Channels of the previous
    /// protocol stay until they go idle. Returns the previous protocol.
    pub async fn set_active_protocol(&self, kind: TransportKind) -> TransportKind {
        let old = {
            let mut active = self.inner.active.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *active, kind)
        };

        if old != kind {
            log::info!("tunnel {}: switching channels {} -> {}", self.inner.session_id, old, kind);
            self.inner
                .handler
                .on_event(TunnelEvent::ProtocolChanged { old, new: kind })
                .await;
        }
        old
    }

    /// Sender for channels opened outside the tunnel's factory, such as
    /// channels accepted from the peer. Pass it to the channel constructor,
    /// then hand the channel to [`add_channel`](Self::add_channel).
    pub fn event_sender(&self) -> EventSender {
        self.inner.events.clone()
    }

    /// Adopt a channel created with [`event_sender`](Self::event_sender).
    ///
    /// A channel beyond the cap, or arriving after close, is closed and
    /// `false` is returned.
    pub async fn add_channel(&self, channel: PacketChannel) -> bool {
        let inner = &self.inner;
        let _state = inner.spawn.lock().await;
        let kind = channel.kind();

        if inner.is_closed() || !inner.has_room(kind) {
            log::debug!(
                "tunnel {}: declining {} channel {} ({} live)",
                inner.session_id,
                kind,
                channel.id(),
                inner.live_count(None)
            );
            channel.retire().await;
            return false;
        }

        inner.register(channel).await;
        true
    }

    pub fn stats(&self) -> TunnelStats {
        self.inner.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Send one IP packet over one of the channels
    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        self.send(Outbound::One(packet)).await
    }

    /// Send a batch of IP packets over a single channel
    pub async fn send_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        self.send(Outbound::Batch(packets)).await
    }

    async fn send(&self, outbound: Outbound<'_>) -> Result<()> {
        let inner = &self.inner;
        let mut attempts = 0;
        loop {
            inner.ensure_open()?;
            let channel = inner.channel_for_send().await?;
            match outbound.send_on(&channel).await {
                Ok(()) => {
                    outbound.record(&inner.counters);
                    inner.maybe_grow();
                    return Ok(());
                }
                Err(e) if is_channel_gone(&e) && attempts + 1 < MAX_SEND_ATTEMPTS => {
                    attempts += 1;
                    log::debug!(
                        "tunnel {}: channel {} unusable ({}), trying another",
                        inner.session_id,
                        channel.id(),
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close every channel, gracefully where the peer cooperates.
    ///
    /// Each channel bounds its own close; stragglers are torn down.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // let an open in progress finish registering its channel
        let _state = timeout(inner.config.close_timeout, inner.spawn.lock()).await;
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(maintenance) = tasks.first() {
            maintenance.abort();
        }

        let channels = self.channels();
        log::info!("tunnel {}: closing {} channels", inner.session_id, channels.len());
        join_all(channels.iter().map(|c| c.close(true))).await;

        for task in tasks.drain(..) {
            task.abort();
        }
        for channel in channels {
            let reason = channel.close_reason().unwrap_or(CloseReason::Local);
            inner.forget(channel.id(), reason).await;
        }

        inner
            .handler
            .on_event(TunnelEvent::Closed {
                session_id: inner.session_id,
            })
            .await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let channels = self.channels();
        if channels.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                join_all(channels.iter().map(|c| c.close(false))).await;
            });
        }
    }
}

fn is_channel_gone(e: &hop_channel::Error) -> bool {
    matches!(e, hop_channel::Error::ChannelClosed) || e.is_transport_failure()
}

async fn dispatch_events(
    tunnel: Weak<TunnelInner>,
    mut events: EventReceiver,
    packets: mpsc::Sender<Vec<u8>>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = tunnel.upgrade() else {
            break;
        };

        match event.kind {
            ChannelEventKind::Packet(packet) => {
                inner.counters.record_rx(packet.len());
                if packets.send(packet).await.is_err() {
                    log::debug!("tunnel {}: packet receiver dropped", inner.session_id);
                }
            }
            ChannelEventKind::Closed(reason) => inner.forget(event.channel_id, reason).await,
        }
    }
}

async fn run_maintenance(tunnel: Weak<TunnelInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = tunnel.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        inner.maintain().await;
    }
}
