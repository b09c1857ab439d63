//! Tunnel events and statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hop_channel::{ChannelId, CloseReason, SessionId, TransportKind};

/// Statistics about a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes received from channels
    pub bytes_rx: u64,
    /// Bytes handed to channels
    pub bytes_tx: u64,
    /// Packets received
    pub packets_rx: u64,
    /// Packets transmitted
    pub packets_tx: u64,
    /// Channels opened over the tunnel's lifetime
    pub channels_opened: u64,
    /// Channels closed for any reason
    pub channels_closed: u64,
    /// Channels lost to transport failure
    pub channels_failed: u64,
    /// Attempts to open a channel that failed
    pub open_failures: u64,
    /// Time since the tunnel was created
    pub uptime: Duration,
}

impl TunnelStats {
    /// Get the total bytes transferred
    pub fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

/// Live counters behind [`TunnelStats`]
#[derive(Debug)]
pub(crate) struct TunnelCounters {
    started: Instant,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    channels_failed: AtomicU64,
    open_failures: AtomicU64,
}

impl TunnelCounters {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_closed: AtomicU64::new(0),
            channels_failed: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self, unexpected: bool) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
        if unexpected {
            self.channels_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            channels_failed: self.channels_failed.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}

/// Events emitted by a tunnel
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A channel joined the tunnel
    ChannelOpened {
        channel_id: ChannelId,
        kind: TransportKind,
    },

    /// A channel left the tunnel
    ChannelClosed {
        channel_id: ChannelId,
        kind: TransportKind,
        reason: CloseReason,
        /// The channel failed rather than being closed by either side
        unexpected: bool,
    },

    /// New channels now use a different protocol
    ProtocolChanged {
        old: TransportKind,
        new: TransportKind,
    },

    /// The tunnel closed all of its channels
    Closed {
        session_id: SessionId,
    },
}

/// Event handler trait for receiving tunnel events
#[async_trait::async_trait]
pub trait TunnelEventHandler: Send + Sync {
    /// Handle a tunnel event
    async fn on_event(&self, event: TunnelEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl TunnelEventHandler for LoggingEventHandler {
    async fn on_event(&self, event: TunnelEvent) {
        match event {
            TunnelEvent::ChannelOpened { channel_id, kind } => {
                log::info!("Channel opened: {} ({})", channel_id, kind);
            }
            TunnelEvent::ChannelClosed {
                channel_id,
                kind,
                reason,
                unexpected,
            } => {
                if unexpected {
                    log::warn!("Channel lost: {} ({}): {}", channel_id, kind, reason);
                } else {
                    log::info!("Channel closed: {} ({}): {}", channel_id, kind, reason);
                }
            }
            TunnelEvent::ProtocolChanged { old, new } => {
                log::info!("Channel protocol: {} -> {}", old, new);
            }
            TunnelEvent::Closed { session_id } => {
                log::info!("Tunnel closed: session={}", session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = TunnelCounters::new();
        counters.record_rx(100);
        counters.record_tx(40);
        counters.record_tx(60);
        counters.record_opened();
        counters.record_closed(false);
        counters.record_closed(true);

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_rx, 100);
        assert_eq!(stats.packets_tx, 2);
        assert_eq!(stats.total_bytes(), 200);
        assert_eq!(stats.channels_closed, 2);
        assert_eq!(stats.channels_failed, 1);
    }
}
