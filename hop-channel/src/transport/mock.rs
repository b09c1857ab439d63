//! In-memory transports for testing
//!
//! # Example
//!
//! ```ignore
//! use hop_channel::transport::mock::MockConnector;
//! use hop_channel::{ConnectionPool, PoolConfig};
//!
//! async fn example() {
//!     // every connection is served by a chunk echo peer
//!     let connector = MockConnector::echo();
//!     let pool = ConnectionPool::new(std::sync::Arc::new(connector), PoolConfig::default());
//!     let mut stream = pool.acquire().await.unwrap();
//!     stream.write(b"ping").await.unwrap();
//! }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

use super::{BoxedStream, DatagramTransport, StreamConnector};
use crate::chunk::ChunkStream;
use crate::error::{Error, Result};

const DUPLEX_BUFFER: usize = 256 * 1024;

enum Acceptor {
    /// Server halves are handed to the test
    Queue(mpsc::UnboundedSender<DuplexStream>),
    /// Server halves are served by [`serve_chunk_echo`]
    Echo,
}

/// Connector producing in-memory duplex streams
pub struct MockConnector {
    acceptor: Acceptor,
    connects: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockConnector {
    /// Connector whose server halves arrive on the returned receiver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            acceptor: Acceptor::Queue(tx),
            connects: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        };
        (connector, rx)
    }

    /// Connector whose peers echo every chunk back and support reuse
    pub fn echo() -> Self {
        Self {
            acceptor: Acceptor::Echo,
            connects: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next connect attempt fail
    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".into()));
        }

        let (client, server) = duplex(DUPLEX_BUFFER);
        match &self.acceptor {
            Acceptor::Queue(tx) => tx
                .send(server)
                .map_err(|_| Error::Transport("mock acceptor gone".into()))?,
            Acceptor::Echo => {
                tokio::spawn(async move {
                    if let Err(e) = serve_chunk_echo(server).await {
                        log::debug!("echo peer stopped: {}", e);
                    }
                });
            }
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(client))
    }
}

/// Echo every chunk back until the peer ends an exchange, then answer with
/// the same kind of terminal marker. Keep-alive exchanges start over on the
/// same connection.
pub async fn serve_chunk_echo<S>(stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut chunks = ChunkStream::new(stream);
    loop {
        while let Some(chunk) = chunks.read_chunk().await? {
            chunks.write(&chunk).await?;
        }

        let keep_alive = chunks.peer_keep_alive();
        chunks.finish(keep_alive).await?;
        if !chunks.can_reuse() {
            return Ok(());
        }
        chunks = chunks.create_reuse()?;
    }
}

type Inbox = (Vec<u8>, SocketAddr);

/// Fake UDP socket
///
/// Sockets created by [`MockDatagramSocket::pair`] deliver to each other;
/// the destination address passed to `send_to` is recorded but not used
/// for delivery.
pub struct MockDatagramSocket {
    local_addr: Mutex<SocketAddr>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbox>>,
    peer: Mutex<Option<mpsc::UnboundedSender<Inbox>>>,
    sent: Mutex<VecDeque<Inbox>>,
}

impl MockDatagramSocket {
    pub fn new(local_addr: SocketAddr) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            local_addr: Mutex::new(local_addr),
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox),
            peer: Mutex::new(None),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Two sockets wired to each other
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(a));
        let b = Arc::new(Self::new(b));
        *lock(&a.peer) = Some(b.inbox_tx.clone());
        *lock(&b.peer) = Some(a.inbox_tx.clone());
        (a, b)
    }

    /// Queue a datagram as if it arrived from `from`
    pub fn inject(&self, data: Vec<u8>, from: SocketAddr) {
        let _ = self.inbox_tx.send((data, from));
    }

    /// Change the address peers see this socket's datagrams coming from
    pub fn rebind(&self, addr: SocketAddr) {
        *lock(&self.local_addr) = addr;
    }

    /// Every datagram sent so far with its destination
    pub fn sent(&self) -> Vec<Inbox> {
        lock(&self.sent).iter().cloned().collect()
    }
}

#[async_trait]
impl DatagramTransport for MockDatagramSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (data, from) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("mock socket closed".into()))?;

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        lock(&self.sent).push_back((buf.to_vec(), addr));

        let from = *lock(&self.local_addr);
        if let Some(peer) = lock(&self.peer).as_ref() {
            let _ = peer.send((buf.to_vec(), from));
        }
        Ok(buf.len())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(*lock(&self.local_addr))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
