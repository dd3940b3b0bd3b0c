//! Bounds-checked, lifecycle-aware access to a [`ReadAt`] implementation.
//!
//! A [`ByteSource`] counts every read that is in flight, whether a point read
//! or a [`RangeStream`], and refuses to close while that count is non-zero.
//! The count is held by a [`ReadToken`] that releases itself on drop, so
//! reads that fail, complete, or are abandoned half way all give it back.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};

use super::{ReadAt, read_exact_at};
use crate::error::{ZipError, ZipResult};

/// Bytes fetched per underlying read while streaming.
const STREAM_CHUNK_SIZE: u64 = 64 * 1024;

/// Random-access byte provider with open/close lifecycle.
pub struct ByteSource {
    reader: Arc<dyn ReadAt>,
    is_open: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl ByteSource {
    /// Wrap a reader. The source starts closed; call [`ByteSource::open`].
    pub fn new(reader: Arc<dyn ReadAt>) -> Self {
        Self {
            reader,
            is_open: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Number of point reads and streams currently in progress.
    pub fn reads_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Open the source. Does nothing if it is already open.
    pub async fn open(&self) -> ZipResult<()> {
        if self.is_open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.reader.open().await {
            self.is_open.store(false, Ordering::Release);
            return Err(err.into());
        }
        Ok(())
    }

    /// Close the source. Does nothing if it is already closed.
    ///
    /// Fails with a usage error while any read or stream is still in flight.
    /// The source is marked closed before the in-flight count is checked, so
    /// a read starting concurrently either sees the source closed or makes
    /// this call fail.
    pub async fn close(&self) -> ZipResult<()> {
        if self
            .is_open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.is_open.store(true, Ordering::SeqCst);
            return Err(ZipError::usage("Cannot close while reading in progress"));
        }
        self.reader.close().await?;
        Ok(())
    }

    /// Read exactly `length` bytes starting at `offset`.
    pub async fn read(&self, offset: u64, length: u64) -> ZipResult<Vec<u8>> {
        let _token = self.begin("read")?;
        if length == 0 {
            return Ok(Vec::new());
        }
        self.check_bounds(offset, length)?;
        let len = usize::try_from(length)
            .map_err(|_| ZipError::usage("read length does not fit in memory"))?;

        let mut buf = vec![0u8; len];
        read_exact_at(self.reader.as_ref(), offset, &mut buf).await?;
        Ok(buf)
    }

    /// Create a stream over `length` bytes starting at `offset`.
    ///
    /// A zero-length request yields an already-ended stream without touching
    /// the reader.
    pub fn stream(&self, offset: u64, length: u64) -> ZipResult<RangeStream> {
        let token = self.begin("stream")?;
        if length == 0 {
            return Ok(RangeStream::empty());
        }
        self.check_bounds(offset, length)?;

        Ok(RangeStream {
            reader: Some(Arc::clone(&self.reader)),
            offset,
            remaining: length,
            chunk: Vec::new(),
            chunk_pos: 0,
            pending: None,
            token: Some(token),
        })
    }

    fn check_bounds(&self, offset: u64, length: u64) -> ZipResult<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(ZipError::format(format!(
                "read of {length} bytes at offset {offset} exceeds source size {}",
                self.size()
            ))),
        }
    }

    /// Count a read as in flight, then check the source is open.
    fn begin(&self, operation: &str) -> ZipResult<ReadToken> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let token = ReadToken {
            counter: Arc::clone(&self.in_flight),
        };
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(ZipError::usage(format!(
                "Cannot call `{operation}()` on a source which is not open"
            )));
        }
        Ok(token)
    }
}

/// One unit of the in-flight read count, returned on drop.
struct ReadToken {
    counter: Arc<AtomicUsize>,
}

impl Drop for ReadToken {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

type ChunkFuture = Pin<Box<dyn Future<Output = io::Result<Vec<u8>>> + Send>>;

/// Lazy stream over a byte range of a [`ByteSource`].
///
/// Holds one unit of the source's in-flight count until it reaches the end of
/// the range, fails, or is dropped.
pub struct RangeStream {
    reader: Option<Arc<dyn ReadAt>>,
    offset: u64,
    remaining: u64,
    chunk: Vec<u8>,
    chunk_pos: usize,
    pending: Option<ChunkFuture>,
    token: Option<ReadToken>,
}

impl RangeStream {
    fn empty() -> Self {
        Self {
            reader: None,
            offset: 0,
            remaining: 0,
            chunk: Vec::new(),
            chunk_pos: 0,
            pending: None,
            token: None,
        }
    }

    fn finish(&mut self) {
        self.reader = None;
        self.pending = None;
        self.token = None;
    }
}

impl AsyncRead for RangeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.chunk_pos < this.chunk.len() {
                let n = buf.remaining().min(this.chunk.len() - this.chunk_pos);
                buf.put_slice(&this.chunk[this.chunk_pos..this.chunk_pos + n]);
                this.chunk_pos += n;
                if this.chunk_pos == this.chunk.len() && this.remaining == 0 {
                    this.finish();
                }
                return Poll::Ready(Ok(()));
            }

            if this.remaining == 0 {
                this.finish();
                return Poll::Ready(Ok(()));
            }

            if this.pending.is_none() {
                let Some(reader) = this.reader.clone() else {
                    return Poll::Ready(Ok(()));
                };
                let offset = this.offset;
                let len = this.remaining.min(STREAM_CHUNK_SIZE) as usize;
                this.pending = Some(Box::pin(async move {
                    let mut chunk = vec![0u8; len];
                    read_exact_at(reader.as_ref(), offset, &mut chunk).await?;
                    Ok(chunk)
                }));
            }

            let result = match this.pending.as_mut() {
                Some(fut) => ready!(fut.as_mut().poll(cx)),
                None => continue,
            };
            this.pending = None;

            match result {
                Ok(chunk) => {
                    this.offset += chunk.len() as u64;
                    this.remaining -= chunk.len() as u64;
                    this.chunk = chunk;
                    this.chunk_pos = 0;
                }
                Err(err) => {
                    this.finish();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}
