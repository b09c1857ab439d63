//! Stream channel
//!
//! Carries one packet per chunk over a [`ChunkStream`]. A reader task
//! delivers inbound packets as channel events; sends go straight to the
//! writer half.
//!
//! Graceful close: the closing side sends a `CloseChannel` notice followed
//! by the keep-alive terminal marker, then waits for the peer's terminal
//! marker. The peer answers with its own keep-alive marker. When both
//! markers made it across, the connection goes back to the pool for reuse.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{check_packet_size, ChannelCore, ChannelId, CloseReason, EventSender, TransportKind};
use crate::chunk::{ChunkReader, ChunkStream, ChunkWriter};
use crate::control::{self, CloseCause, ControlMessage};
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::transport::BoxedStream;

type Reader = ChunkReader<ReadHalf<BoxedStream>>;
type Writer = ChunkWriter<WriteHalf<BoxedStream>>;

/// Stream channel settings
#[derive(Clone)]
pub struct StreamChannelConfig {
    /// Idle time after which the owner may close the channel
    pub lifespan: Option<Duration>,
    /// Bound on each step of a graceful close
    pub close_timeout: Duration,
    /// Pool that receives the connection after a clean close
    pub pool: Option<Arc<ConnectionPool>>,
}

impl Default for StreamChannelConfig {
    fn default() -> Self {
        Self {
            lifespan: None,
            close_timeout: Duration::from_secs(3),
            pool: None,
        }
    }
}

impl fmt::Debug for StreamChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannelConfig")
            .field("lifespan", &self.lifespan)
            .field("close_timeout", &self.close_timeout)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Packet channel over a chunked byte stream
#[derive(Clone)]
pub struct StreamChannel {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    core: ChannelCore,
    writer: Mutex<Option<Writer>>,
    reader_task: StdMutex<Option<JoinHandle<Option<Reader>>>>,
    close_timeout: Duration,
    pool: Option<Arc<ConnectionPool>>,
}

impl StreamChannel {
    /// Start a channel on `stream`. Must be called from within a tokio runtime.
    pub fn new(stream: ChunkStream<BoxedStream>, config: StreamChannelConfig, events: EventSender) -> Self {
        let (reader, writer) = stream.into_parts();
        let inner = Arc::new(StreamInner {
            core: ChannelCore::new(TransportKind::Stream, config.lifespan, events),
            writer: Mutex::new(Some(writer)),
            reader_task: StdMutex::new(None),
            close_timeout: config.close_timeout,
            pool: config.pool,
        });

        let task = tokio::spawn(read_loop(inner.clone(), reader));
        *inner.reader_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        log::debug!("stream channel {} opened", inner.core.id());
        Self { inner }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.core.id()
    }

    pub(super) fn core(&self) -> &ChannelCore {
        &self.inner.core
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        self.write_packets(&[packet]).await
    }

    pub async fn send_packets(&self, packets: &[Vec<u8>]) -> Result<()> {
        let packets: Vec<&[u8]> = packets.iter().map(Vec::as_slice).collect();
        self.write_packets(&packets).await
    }

    async fn write_packets(&self, packets: &[&[u8]]) -> Result<()> {
        for packet in packets {
            check_packet_size(packet)?;
        }

        let core = &self.inner.core;
        core.ensure_open()?;
        let _pending = core.pending();
        let mut shutdown = core.shutdown_signal();

        let result = tokio::select! {
            result = self.inner.write_locked(packets) => result,
            _ = shutdown.wait_for(|closed| *closed) => Err(Error::ChannelClosed),
        };

        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.inner.fail(e.to_string(), true);
            }
        }
        result
    }

    pub(super) async fn shutdown(&self, cause: CloseCause, notify_peer: bool, reason: CloseReason) {
        let inner = &self.inner;
        if !inner.core.begin_close() {
            return;
        }
        if !notify_peer {
            inner.teardown(reason, true);
            return;
        }

        let writer = match timeout(inner.close_timeout, inner.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut writer) = writer else {
            inner.teardown(reason, true);
            return;
        };

        let notice = ControlMessage::close(cause).encode();
        let sent = timeout(inner.close_timeout, async {
            writer.write_chunk(&notice).await?;
            writer.finish(true).await
        })
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            log::debug!("stream channel {}: close notice not delivered", inner.core.id());
            inner.teardown(reason, true);
            return;
        }

        if let Some(reader) = inner.join_reader().await {
            inner.recycle(ChunkStream::from_parts(reader, writer));
        }
        inner.core.finish_close(reason);
    }
}

impl StreamInner {
    async fn write_locked(&self, packets: &[&[u8]]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ChannelClosed)?;
        for packet in packets.iter().filter(|p| !p.is_empty()) {
            // one chunk per packet, the peer delivers each chunk as a packet
            writer.write_chunk(packet).await?;
            self.core.record_sent(packet.len());
        }
        Ok(())
    }

    /// Abrupt close after a transport failure
    fn fail(self: &Arc<Self>, reason: String, abort_reader: bool) {
        if self.core.begin_close() {
            self.teardown(CloseReason::Failed(reason), abort_reader);
        }
    }

    /// Drop the connection without a handshake
    fn teardown(self: &Arc<Self>, reason: CloseReason, abort_reader: bool) {
        self.core.signal_shutdown();
        if abort_reader {
            if let Some(task) = self.take_reader_task() {
                task.abort();
            }
        }

        match self.writer.try_lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(_) => {
                // an in-flight send holds the writer until it sees the signal
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.writer.lock().await.take();
                });
            }
        }
        self.core.finish_close(reason);
    }

    /// Peer ended its half first: answer with our terminal marker
    async fn finish_remote_close(&self, reader: Reader) {
        let writer = match timeout(self.close_timeout, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(mut writer) = writer {
            match timeout(self.close_timeout, writer.finish(true)).await {
                Ok(Ok(())) => self.recycle(ChunkStream::from_parts(reader, writer)),
                _ => log::debug!("stream channel {}: could not answer peer close", self.core.id()),
            }
        }
        self.core.finish_close(CloseReason::Remote);
    }

    async fn join_reader(&self) -> Option<Reader> {
        let mut task = self.take_reader_task()?;
        match timeout(self.close_timeout, &mut task).await {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => {
                log::debug!("stream channel {}: reader ended abnormally: {}", self.core.id(), e);
                None
            }
            Err(_) => {
                log::debug!("stream channel {}: peer did not finish in time", self.core.id());
                task.abort();
                None
            }
        }
    }

    fn recycle(&self, stream: ChunkStream<BoxedStream>) {
        if let Some(pool) = &self.pool {
            pool.release(stream);
        }
    }

    fn take_reader_task(&self) -> Option<JoinHandle<Option<Reader>>> {
        self.reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Deliver inbound packets until the peer ends its half of the exchange.
///
/// Returns the reader when a local close is waiting for it.
async fn read_loop(inner: Arc<StreamInner>, mut reader: Reader) -> Option<Reader> {
    let id = inner.core.id();
    loop {
        match reader.read_chunk().await {
            Ok(Some(payload)) if control::is_control_message(&payload) => {
                inner.core.touch();
                match ControlMessage::decode(&payload) {
                    Ok(ControlMessage::CloseChannel(cause)) => {
                        log::debug!("stream channel {}: peer closing ({:?})", id, cause)
                    }
                    Err(e) => log::debug!("stream channel {}: {}", id, e),
                }
            }
            Ok(Some(packet)) => {
                inner.core.deliver(packet).await;
            }
            Ok(None) => break,
            Err(e) => {
                inner.fail(e.to_string(), false);
                return None;
            }
        }
    }

    if !inner.core.begin_close() {
        return Some(reader);
    }
    inner.finish_remote_close(reader).await;
    None
}
