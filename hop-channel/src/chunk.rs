//! Chunked framing over a byte stream
//!
//! A stream channel turns a connected byte stream into a sequence of
//! length-prefixed chunks:
//!
//! ```text
//! +----------------------+-----------------------------+
//! | length (u32, LE)     | payload (length bytes)      |
//! +----------------------+-----------------------------+
//! ```
//!
//! A length of `0` or `0xFFFF_FFFF` ends the sender's half of the current
//! exchange. `0` means the sender is willing to reuse the connection for a
//! new exchange, `0xFFFF_FFFF` means it is not. Any other length above the
//! configured maximum is a protocol violation.
//!
//! A connection can be reused only when both sides ended the exchange with
//! the keep-alive marker and nothing failed on the way; see
//! [`ChunkStream::can_reuse`].

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, Result};

pub const CHUNK_HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

const END_KEEP_ALIVE: u32 = 0;
const END_CLOSE: u32 = u32::MAX;

/// Reading half of a chunked stream
#[derive(Debug)]
pub struct ChunkReader<R> {
    inner: R,
    max_chunk_size: usize,
    // unread bytes of the current chunk
    remaining: usize,
    read_chunk_count: u64,
    // Some(keep_alive) once the peer's terminal marker was read
    end: Option<bool>,
    failed: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(inner: R, max_chunk_size: usize) -> Self {
        Self {
            inner,
            max_chunk_size,
            remaining: 0,
            read_chunk_count: 0,
            end: None,
            failed: false,
        }
    }

    /// Read payload bytes, crossing chunk boundaries transparently.
    ///
    /// Returns 0 once the peer's terminal marker has been read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        if buf.is_empty() {
            return Ok(0);
        }

        while self.remaining == 0 {
            if self.end.is_some() || !self.next_header().await? {
                return Ok(0);
            }
        }

        let want = buf.len().min(self.remaining);
        let n = match self.inner.read(&mut buf[..want]).await {
            Ok(n) => n,
            Err(e) => {
                self.failed = true;
                return Err(e.into());
            }
        };
        if n == 0 {
            self.failed = true;
            return Err(Error::Transport("connection closed inside a chunk".into()));
        }

        self.remaining -= n;
        Ok(n)
    }

    /// Read the rest of the current chunk, or the next whole chunk.
    ///
    /// Returns `None` once the peer's terminal marker has been read.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.check_usable()?;
        if self.remaining == 0 && (self.end.is_some() || !self.next_header().await?) {
            return Ok(None);
        }

        let mut chunk = vec![0u8; self.remaining];
        if let Err(e) = self.inner.read_exact(&mut chunk).await {
            self.failed = true;
            return Err(e.into());
        }
        self.remaining = 0;
        Ok(Some(chunk))
    }

    /// Discard data until the peer's terminal marker. Returns the number of
    /// payload bytes skipped.
    pub async fn drain(&mut self) -> Result<u64> {
        let mut skipped = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            skipped += chunk.len() as u64;
        }
        Ok(skipped)
    }

    pub fn read_chunk_count(&self) -> u64 {
        self.read_chunk_count
    }

    /// The peer ended its half of the exchange
    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    /// The peer ended its half with the keep-alive marker
    pub fn peer_keep_alive(&self) -> bool {
        self.end == Some(true)
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn is_reusable(&self) -> bool {
        self.end == Some(true) && !self.failed && self.remaining == 0
    }

    /// Poll the connection once without waiting. An idle connection between
    /// exchanges has nothing to read; end of stream, an error or unexpected
    /// data all mean it is unusable.
    fn is_idle(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte).now_or_never() {
            None => true,
            Some(_) => {
                self.failed = true;
                false
            }
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(Error::InvalidOperation(
                "read from a failed chunk stream".into(),
            ));
        }
        Ok(())
    }

    /// Read the next header. Returns false on a terminal marker.
    async fn next_header(&mut self) -> Result<bool> {
        let mut header = [0u8; CHUNK_HEADER_LEN];
        if let Err(e) = self.inner.read_exact(&mut header).await {
            self.failed = true;
            return Err(e.into());
        }

        match u32::from_le_bytes(header) {
            END_KEEP_ALIVE => {
                self.end = Some(true);
                Ok(false)
            }
            END_CLOSE => {
                self.end = Some(false);
                Ok(false)
            }
            len if len as usize > self.max_chunk_size => {
                self.failed = true;
                Err(Error::Protocol(format!(
                    "chunk length {} exceeds limit {}",
                    len, self.max_chunk_size
                )))
            }
            len => {
                self.remaining = len as usize;
                self.read_chunk_count += 1;
                Ok(true)
            }
        }
    }
}

/// Writing half of a chunked stream
#[derive(Debug)]
pub struct ChunkWriter<W> {
    inner: W,
    max_chunk_size: usize,
    wrote_chunk_count: u64,
    // Some(keep_alive) once our terminal marker was written
    end: Option<bool>,
    failed: bool,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(inner: W, max_chunk_size: usize) -> Self {
        Self {
            inner,
            max_chunk_size,
            wrote_chunk_count: 0,
            end: None,
            failed: false,
        }
    }

    /// Write `buf` as one or more chunks of at most the configured size.
    ///
    /// Empty writes send nothing.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(());
        }
        let max_chunk_size = self.max_chunk_size;
        self.write_frames(buf.chunks(max_chunk_size)).await
    }

    /// Write `buf` as exactly one chunk.
    ///
    /// Fails with [`Error::ChunkTooLarge`] before sending anything if `buf`
    /// exceeds the configured chunk size. Empty writes send nothing.
    pub async fn write_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        if buf.len() > self.max_chunk_size {
            return Err(Error::ChunkTooLarge {
                size: buf.len(),
                max: self.max_chunk_size,
            });
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.write_frames(std::iter::once(buf)).await
    }

    fn check_writable(&self) -> Result<()> {
        if self.failed {
            return Err(Error::InvalidOperation("write to a failed chunk stream".into()));
        }
        if self.end.is_some() {
            return Err(Error::InvalidOperation("write after finish".into()));
        }
        Ok(())
    }

    async fn write_frames<'b>(&mut self, pieces: impl Iterator<Item = &'b [u8]>) -> Result<()> {
        // stays set if the write is cancelled part way through a frame
        self.failed = true;
        for piece in pieces {
            let mut frame = Vec::with_capacity(CHUNK_HEADER_LEN + piece.len());
            frame.extend_from_slice(&(piece.len() as u32).to_le_bytes());
            frame.extend_from_slice(piece);
            self.inner.write_all(&frame).await?;
            self.wrote_chunk_count += 1;
        }
        self.inner.flush().await?;
        self.failed = false;
        Ok(())
    }

    /// End our half of the exchange. Idempotent.
    pub async fn finish(&mut self, keep_alive: bool) -> Result<()> {
        if self.end.is_some() {
            return Ok(());
        }
        if self.failed {
            return Err(Error::InvalidOperation("finish on a failed chunk stream".into()));
        }

        let marker = if keep_alive { END_KEEP_ALIVE } else { END_CLOSE };
        self.failed = true;
        self.inner.write_all(&marker.to_le_bytes()).await?;
        self.inner.flush().await?;
        self.failed = false;
        self.end = Some(keep_alive);
        Ok(())
    }

    /// Shut down the underlying writer
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn wrote_chunk_count(&self) -> u64 {
        self.wrote_chunk_count
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn is_reusable(&self) -> bool {
        self.end == Some(true) && !self.failed
    }
}

/// Both halves of a chunked stream
#[derive(Debug)]
pub struct ChunkStream<S> {
    reader: ChunkReader<ReadHalf<S>>,
    writer: ChunkWriter<WriteHalf<S>>,
    max_chunk_size: usize,
}

impl<S: AsyncRead + AsyncWrite> ChunkStream<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_chunk_size(stream, DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk_size(stream: S, max_chunk_size: usize) -> Self {
        let max_chunk_size = max_chunk_size.clamp(1, (END_CLOSE - 1) as usize);
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: ChunkReader::new(read_half, max_chunk_size),
            writer: ChunkWriter::new(write_half, max_chunk_size),
            max_chunk_size,
        }
    }

    /// Reassemble a stream from halves taken with [`ChunkStream::into_parts`]
    pub fn from_parts(reader: ChunkReader<ReadHalf<S>>, writer: ChunkWriter<WriteHalf<S>>) -> Self {
        let max_chunk_size = writer.max_chunk_size;
        Self {
            reader,
            writer,
            max_chunk_size,
        }
    }

    pub fn into_parts(self) -> (ChunkReader<ReadHalf<S>>, ChunkWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write(buf).await
    }

    pub async fn write_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_chunk(buf).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.read_chunk().await
    }

    pub async fn finish(&mut self, keep_alive: bool) -> Result<()> {
        self.writer.finish(keep_alive).await
    }

    pub async fn drain(&mut self) -> Result<u64> {
        self.reader.drain().await
    }

    pub fn wrote_chunk_count(&self) -> u64 {
        self.writer.wrote_chunk_count()
    }

    pub fn read_chunk_count(&self) -> u64 {
        self.reader.read_chunk_count()
    }

    pub fn peer_keep_alive(&self) -> bool {
        self.reader.peer_keep_alive()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// A reusable connection whose peer has not closed it or started
    /// sending since the last exchange ended
    pub fn is_idle_and_open(&mut self) -> bool {
        self.can_reuse() && self.reader.is_idle()
    }

    /// Both sides ended the exchange with keep-alive and nothing failed
    pub fn can_reuse(&self) -> bool {
        self.writer.is_reusable() && self.reader.is_reusable()
    }

    /// Start a fresh exchange on the same connection with reset counters
    pub fn create_reuse(self) -> Result<Self> {
        if !self.can_reuse() {
            return Err(Error::InvalidOperation(
                "connection cannot be reused: exchange not completed with keep-alive".into(),
            ));
        }

        let max_chunk_size = self.max_chunk_size;
        Ok(Self {
            reader: ChunkReader::new(self.reader.inner, max_chunk_size),
            writer: ChunkWriter::new(self.writer.inner, max_chunk_size),
            max_chunk_size,
        })
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> S
    where
        S: Unpin,
    {
        self.reader.inner.unsplit(self.writer.inner)
    }
}
