//! Connection pool for stream channels
//!
//! Connections whose last exchange ended cleanly with keep-alive on both
//! sides are kept in a free list and handed to the next stream channel
//! instead of dialing again. [`ConnectionPool::acquire`] falls back to a
//! new connection when the free list is empty or a pooled connection turns
//! out to be unusable.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::chunk::{ChunkStream, DEFAULT_MAX_CHUNK_SIZE};
use crate::error::Result;
use crate::transport::{BoxedStream, StreamConnector};

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on idle pooled connections
    pub max_free_connections: usize,
    /// Pooled connections idle longer than this are discarded
    pub free_idle_timeout: Duration,
    /// Largest chunk, and so the largest packet a stream channel can carry
    pub max_chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_connections: 16,
            free_idle_timeout: Duration::from_secs(60),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

struct FreeConnection {
    stream: ChunkStream<BoxedStream>,
    released_at: Instant,
}

/// Pool of reusable chunked connections to one peer
pub struct ConnectionPool {
    connector: Arc<dyn StreamConnector>,
    config: PoolConfig,
    free: Mutex<VecDeque<FreeConnection>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn StreamConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            free: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take an idle pooled connection, if one is still fresh
    ///
    /// The returned stream has finished its previous exchange and still
    /// needs [`ChunkStream::create_reuse`] before use.
    pub fn try_acquire_free(&self) -> Option<ChunkStream<BoxedStream>> {
        let mut free = self.lock_free();
        while let Some(connection) = free.pop_back() {
            if connection.released_at.elapsed() <= self.config.free_idle_timeout {
                return Some(connection.stream);
            }
            log::debug!("discarding stale pooled connection");
        }
        None
    }

    /// A connection ready for a new exchange: pooled if possible, new otherwise
    pub async fn acquire(&self) -> Result<ChunkStream<BoxedStream>> {
        while let Some(mut stream) = self.try_acquire_free() {
            if !stream.is_idle_and_open() {
                log::debug!("pooled connection closed by peer, discarding");
                continue;
            }
            match stream.create_reuse() {
                Ok(stream) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    log::debug!("reusing pooled connection");
                    return Ok(stream);
                }
                Err(e) => log::debug!("pooled connection unusable, dialing: {}", e),
            }
        }

        let stream = self.connector.connect().await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(ChunkStream::with_max_chunk_size(
            stream,
            self.config.max_chunk_size,
        ))
    }

    /// Return a connection after its exchange. Only cleanly finished
    /// connections are kept; returns whether this one was.
    pub fn release(&self, stream: ChunkStream<BoxedStream>) -> bool {
        if !stream.can_reuse() {
            log::debug!("dropping connection that cannot be reused");
            return false;
        }

        let mut free = self.lock_free();
        if free.len() >= self.config.max_free_connections {
            return false;
        }
        free.push_back(FreeConnection {
            stream,
            released_at: Instant::now(),
        });
        true
    }

    /// Connections dialed through the connector
    pub fn created_connection_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Acquisitions served by a pooled connection
    pub fn reused_connection_succeeded_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn free_connection_count(&self) -> usize {
        self.lock_free().len()
    }

    /// Drop every idle connection
    pub fn clear(&self) {
        self.lock_free().clear();
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, VecDeque<FreeConnection>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("free", &self.free_connection_count())
            .field("created", &self.created_connection_count())
            .field("reused", &self.reused_connection_succeeded_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;

    async fn exchange(stream: &mut ChunkStream<BoxedStream>, payload: &[u8]) {
        stream.write(payload).await.unwrap();
        stream.finish(true).await.unwrap();
        let mut echoed = Vec::new();
        while let Some(chunk) = stream.read_chunk().await.unwrap() {
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn test_sequential_requests_reuse_one_connection() {
        let pool = ConnectionPool::new(Arc::new(MockConnector::echo()), PoolConfig::default());

        for i in 0..3u8 {
            let mut stream = pool.acquire().await.unwrap();
            exchange(&mut stream, &[i; 10]).await;
            assert!(pool.release(stream));
        }

        assert_eq!(pool.created_connection_count(), 1);
        assert_eq!(pool.reused_connection_succeeded_count(), 2);
        assert_eq!(pool.free_connection_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_dial_when_free_list_is_short() {
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(MockConnector::echo()),
            PoolConfig::default(),
        ));

        let mut stream = pool.acquire().await.unwrap();
        exchange(&mut stream, b"warm-up").await;
        assert!(pool.release(stream));
        assert_eq!(pool.created_connection_count(), 1);

        let streams = futures::future::join_all((0..3).map(|_| pool.acquire())).await;
        assert_eq!(pool.created_connection_count(), 3);
        assert_eq!(pool.reused_connection_succeeded_count(), 1);

        let tasks: Vec<_> = streams
            .into_iter()
            .enumerate()
            .map(|(i, stream)| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let mut stream = stream.unwrap();
                    exchange(&mut stream, format!("request {}", i).as_bytes()).await;
                    pool.release(stream)
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(pool.free_connection_count(), 3);
    }

    #[tokio::test]
    async fn test_unfinished_connections_are_not_pooled() {
        let pool = ConnectionPool::new(Arc::new(MockConnector::echo()), PoolConfig::default());

        let mut stream = pool.acquire().await.unwrap();
        stream.write(b"abandoned").await.unwrap();
        assert!(!pool.release(stream));
        assert_eq!(pool.free_connection_count(), 0);

        let mut stream = pool.acquire().await.unwrap();
        stream.finish(false).await.unwrap();
        while stream.read_chunk().await.unwrap().is_some() {}
        assert!(!pool.release(stream));

        assert_eq!(pool.created_connection_count(), 2);
        assert_eq!(pool.reused_connection_succeeded_count(), 0);
    }

    #[tokio::test]
    async fn test_free_list_bounds() {
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::echo()),
            PoolConfig {
                max_free_connections: 1,
                free_idle_timeout: Duration::ZERO,
                ..PoolConfig::default()
            },
        );

        let mut a = pool.acquire().await.unwrap();
        let mut b = pool.acquire().await.unwrap();
        exchange(&mut a, b"a").await;
        exchange(&mut b, b"b").await;
        assert!(pool.release(a));
        assert!(!pool.release(b));

        // the pooled connection is already older than the idle timeout
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.try_acquire_free().is_none());
    }

    #[tokio::test]
    async fn test_connection_closed_while_pooled_is_not_reused() {
        let (connector, mut accepted) = MockConnector::new();
        let pool = ConnectionPool::new(Arc::new(connector), PoolConfig::default());

        let mut client = pool.acquire().await.unwrap();
        let mut server = ChunkStream::new(accepted.recv().await.unwrap());
        client.finish(true).await.unwrap();
        assert!(server.read_chunk().await.unwrap().is_none());
        server.finish(true).await.unwrap();
        assert!(client.read_chunk().await.unwrap().is_none());
        assert!(pool.release(client));

        // peer goes away while the connection sits in the free list
        drop(server);

        let _fresh = pool.acquire().await.unwrap();
        assert_eq!(pool.created_connection_count(), 2);
        assert_eq!(pool.reused_connection_succeeded_count(), 0);
        assert_eq!(pool.free_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let connector = Arc::new(MockConnector::echo());
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());

        connector.fail_next_connect();
        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_ok());
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.created_connection_count(), 1);
    }
}
