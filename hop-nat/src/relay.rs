//! UDP relay pool
//!
//! Forwards UDP payloads from tunneled flows to their real destinations.
//! Each flow key gets a worker that owns one unconnected UDP socket; the
//! worker's receive loop tags every reply with the flow's original source
//! so it can be written back into the tunnel.
//!
//! Workers are created on demand and retired by a periodic sweep once they
//! have been idle for [`RelayConfig::idle_timeout`]. A worker only retires
//! when no send holds a lease on it, and a send that finds its worker
//! already retired transparently gets a fresh one.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::flow::KeyingMode;
use crate::packet::{build_udp_packet, IpPacketInfo, IPPROTO_UDP};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Relay pool settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mode: KeyingMode,
    /// Idle time after which a worker is retired
    pub idle_timeout: Duration,
    /// How often idle workers are swept
    pub sweep_interval: Duration,
    pub max_workers: usize,
    /// Capacity of the reply queue handed out by [`RelayPool::new`]
    pub reply_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: KeyingMode::Basic,
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
            max_workers: 2048,
            reply_queue_capacity: 1024,
        }
    }
}

/// A datagram received from a relayed destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReply {
    /// Tunnel-side source of the flow the reply belongs to
    pub source: SocketAddr,
    /// Remote endpoint the reply came from
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
}

impl RelayReply {
    /// Wrap the reply in an IP/UDP packet addressed back to the flow's source
    pub fn to_packet(&self) -> Result<Vec<u8>> {
        build_udp_packet(self.remote, self.source, &self.payload)
    }
}

/// Worker identity. The destination is only part of it in extended mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub source: SocketAddr,
    pub destination: Option<SocketAddr>,
}

impl RelayKey {
    pub fn new(mode: KeyingMode, source: SocketAddr, destination: SocketAddr) -> Self {
        match mode {
            KeyingMode::Basic => Self {
                source,
                destination: None,
            },
            KeyingMode::Extended => Self {
                source,
                destination: Some(destination),
            },
        }
    }
}

/// Relay pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub workers_created: u64,
    pub workers_retired: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    workers_created: AtomicU64,
    workers_retired: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl RelayCounters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            workers_created: self.workers_created.load(Ordering::Relaxed),
            workers_retired: self.workers_retired.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct WorkerState {
    closed: bool,
    active: usize,
    last_used: Instant,
}

struct RelayWorker {
    key: RelayKey,
    socket: Arc<UdpSocket>,
    state: Mutex<WorkerState>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayWorker {
    fn lease(self: &Arc<Self>) -> Option<WorkerLease> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return None;
        }
        state.active += 1;
        state.last_used = Instant::now();
        Some(WorkerLease {
            worker: self.clone(),
        })
    }

    fn touch(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_used = Instant::now();
    }

    /// Mark the worker closed if it is idle and unleased
    fn try_retire(&self, idle_timeout: Duration, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return true;
        }
        if state.active == 0 && now.saturating_duration_since(state.last_used) >= idle_timeout {
            state.closed = true;
            return true;
        }
        false
    }

    fn shutdown(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        if let Some(task) = self.recv_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

struct WorkerLease {
    worker: Arc<RelayWorker>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut state = self.worker.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active -= 1;
        state.last_used = Instant::now();
    }
}

struct PoolInner {
    config: RelayConfig,
    workers: DashMap<RelayKey, Arc<RelayWorker>>,
    replies: mpsc::Sender<RelayReply>,
    counters: Arc<RelayCounters>,
    closed: AtomicBool,
}

impl PoolInner {
    fn worker_for(&self, key: RelayKey, destination: SocketAddr) -> Result<Arc<RelayWorker>> {
        if let Some(worker) = self.workers.get(&key) {
            return Ok(worker.value().clone());
        }

        if self.workers.len() >= self.config.max_workers {
            return Err(Error::WorkerLimit(self.config.max_workers));
        }

        match self.workers.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let worker = self.spawn_worker(key, destination)?;
                slot.insert(worker.clone());
                Ok(worker)
            }
        }
    }

    fn spawn_worker(&self, key: RelayKey, destination: SocketAddr) -> Result<Arc<RelayWorker>> {
        let bind_addr = if destination.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let std_socket = std::net::UdpSocket::bind(bind_addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);

        let worker = Arc::new(RelayWorker {
            key,
            socket,
            state: Mutex::new(WorkerState {
                closed: false,
                active: 0,
                last_used: Instant::now(),
            }),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(relay_replies(
            worker.clone(),
            self.replies.clone(),
            self.counters.clone(),
        ));
        *worker.recv_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.counters.workers_created.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "relay worker for {} bound to {:?}",
            key.source,
            worker.socket.local_addr().ok()
        );
        Ok(worker)
    }

    fn retire_idle(&self) -> usize {
        let now = Instant::now();
        let snapshot: Vec<(RelayKey, Arc<RelayWorker>)> = self
            .workers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut retired = 0;
        for (key, worker) in snapshot {
            if !worker.try_retire(self.config.idle_timeout, now) {
                continue;
            }
            self.workers
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &worker));
            worker.shutdown();
            retired += 1;
        }

        if retired > 0 {
            self.counters
                .workers_retired
                .fetch_add(retired as u64, Ordering::Relaxed);
            log::debug!("relay retired {} idle workers", retired);
        }
        retired
    }
}

/// Pool of per-flow UDP relay workers
pub struct RelayPool {
    inner: Arc<PoolInner>,
    sweeper: JoinHandle<()>,
}

impl RelayPool {
    /// Create a pool and the queue its replies are delivered on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RelayConfig) -> (Self, mpsc::Receiver<RelayReply>) {
        let (replies, reply_rx) = mpsc::channel(config.reply_queue_capacity.max(1));
        let inner = Arc::new(PoolInner {
            config,
            workers: DashMap::new(),
            replies,
            counters: Arc::new(RelayCounters::default()),
            closed: AtomicBool::new(false),
        });
        let sweeper = tokio::spawn(sweep_idle_workers(Arc::downgrade(&inner)));
        (Self { inner, sweeper }, reply_rx)
    }

    /// Relay the payload of an outbound IP/UDP packet
    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let info = IpPacketInfo::parse(packet)?;
        if info.protocol != IPPROTO_UDP {
            return Err(Error::UnsupportedProtocol(info.protocol));
        }
        let (source_port, destination_port) = info
            .ports()
            .ok_or_else(|| Error::InvalidPacket("truncated UDP header".into()))?;
        let payload = info
            .udp_payload()
            .ok_or_else(|| Error::InvalidPacket("truncated UDP header".into()))?;

        self.send_to(
            SocketAddr::new(info.source, source_port),
            SocketAddr::new(info.destination, destination_port),
            payload,
        )
        .await
    }

    /// Relay `payload` from the tunneled `source` to `destination`
    pub async fn send_to(&self, source: SocketAddr, destination: SocketAddr, payload: &[u8]) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let key = RelayKey::new(self.inner.config.mode, source, destination);
        let lease = loop {
            let worker = self.inner.worker_for(key, destination)?;
            if let Some(lease) = worker.lease() {
                break lease;
            }
            // retired between lookup and lease
            self.inner
                .workers
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &worker));
        };

        lease.worker.socket.send_to(payload, destination).await?;
        self.inner
            .counters
            .packets_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retire idle workers now instead of waiting for the next sweep
    pub fn retire_idle(&self) -> usize {
        self.inner.retire_idle()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.inner.counters.snapshot()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Stop every worker and refuse further sends
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sweeper.abort();

        let workers: Vec<Arc<RelayWorker>> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.workers.clear();
        for worker in workers {
            worker.shutdown();
        }
        log::debug!("relay pool closed");
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.close();
    }
}

async fn relay_replies(
    worker: Arc<RelayWorker>,
    replies: mpsc::Sender<RelayReply>,
    counters: Arc<RelayCounters>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, remote) = match worker.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP port unreachable surfaces here on some platforms
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::warn!("relay socket for {} failed: {}", worker.key.source, e);
                break;
            }
        };

        worker.touch();
        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        let reply = RelayReply {
            source: worker.key.source,
            remote,
            payload: buf[..len].to_vec(),
        };
        if replies.send(reply).await.is_err() {
            break;
        }
    }
}

async fn sweep_idle_workers(pool: Weak<PoolInner>) {
    let Some(interval) = pool.upgrade().map(|p| p.config.sweep_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.retire_idle();
    }
}
