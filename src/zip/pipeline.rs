//! Stream stages between an entry's raw bytes and the caller.
//!
//! Each stage is an [`AsyncRead`] adapter over the previous one:
//!
//! ```text
//! RangeStream -> InflateReader -> SizeCheckReader -> Crc32Reader -> EntryReader
//! ```
//!
//! Stages report validation failures as [`std::io::Error`]s wrapping a
//! [`ZipError`], which [`ZipError::from_stream_error`] recovers.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use crate::error::{ZipError, ZipResult};
use crate::io::RangeStream;

use super::archive::ArchiveShared;
use super::entry::ZipFileEntry;

/// What a stream opened on an entry should do, after option defaults.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamPlan {
    pub decompress: bool,
    pub validate_crc32: bool,
    pub start: u64,
    pub end: u64,
}

/// Upper bound on the output handed to one `decompress` call, so a large
/// unfilled buffer is not zeroed up front.
const INFLATE_CHUNK_SIZE: usize = 64 * 1024;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Compose the stages a plan asks for on top of the raw data stream.
pub(crate) fn build(
    raw: RangeStream,
    plan: StreamPlan,
    entry: &ZipFileEntry,
    archive: Arc<ArchiveShared>,
) -> EntryReader {
    let mut reader: BoxedRead = Box::new(raw);
    if plan.decompress {
        reader = Box::new(InflateReader::new(reader));
        if archive.options.validate_entry_sizes {
            reader = Box::new(SizeCheckReader::new(reader, entry.clone(), archive));
        }
    }
    if plan.validate_crc32 {
        reader = Box::new(Crc32Reader::new(reader, entry.crc32()));
    }
    EntryReader { inner: reader }
}

/// Readable stream of an entry's data, returned by
/// [`ZipFileEntry::open_read_stream`].
///
/// Validation failures surface as I/O errors when the offending bytes (or
/// the end of the stream) are read.
pub struct EntryReader {
    inner: BoxedRead,
}

impl EntryReader {
    /// Read the rest of the stream into memory.
    pub async fn read_to_vec(&mut self) -> ZipResult<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)
            .await
            .map_err(ZipError::from_stream_error)?;
        Ok(out)
    }
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader").finish_non_exhaustive()
    }
}

impl AsyncRead for EntryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Raw deflate decompression.
pub(crate) struct InflateReader<R> {
    inner: BufReader<R>,
    decompress: Decompress,
    done: bool,
}

impl<R: AsyncRead> InflateReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            decompress: Decompress::new(false),
            done: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for InflateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.done || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let input = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
            let eof = input.is_empty();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };

            let out_len = buf.remaining().min(INFLATE_CHUNK_SIZE);
            let in_before = this.decompress.total_in();
            let out_before = this.decompress.total_out();
            let status = this
                .decompress
                .decompress(input, buf.initialize_unfilled_to(out_len), flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (this.decompress.total_in() - in_before) as usize;
            let produced = (this.decompress.total_out() - out_before) as usize;

            Pin::new(&mut this.inner).consume(consumed);
            buf.advance(produced);

            if status == Status::StreamEnd {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            if produced > 0 {
                return Poll::Ready(Ok(()));
            }
            if eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "deflate stream ended prematurely",
                )));
            }
            if consumed == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                )));
            }
        }
    }
}

/// Counts uncompressed bytes against the entry's expected size.
///
/// When an entry whose size is not yet certain overruns it, the true size is
/// taken to be 4 GiB larger and written back to the entry, which also
/// confirms the archive as quirked.
pub(crate) struct SizeCheckReader<R> {
    inner: R,
    entry: ZipFileEntry,
    archive: Arc<ArchiveShared>,
    byte_count: u64,
    expected: u64,
    finished: bool,
}

impl<R> SizeCheckReader<R> {
    pub fn new(inner: R, entry: ZipFileEntry, archive: Arc<ArchiveShared>) -> Self {
        let expected = entry.uncompressed_size();
        Self {
            inner,
            entry,
            archive,
            byte_count: 0,
            expected,
            finished: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeCheckReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;

        if n == 0 && buf.remaining() > 0 {
            if !this.finished {
                this.finished = true;
                if this.byte_count < this.expected {
                    return Poll::Ready(Err(ZipError::TooFewBytes {
                        expected: this.expected,
                        actual: this.byte_count,
                    }
                    .into()));
                }
                this.archive.resolve_entry_size(&this.entry.inner);
            }
            return Poll::Ready(Ok(()));
        }

        this.byte_count += n;
        if this.byte_count > this.expected {
            this.expected = this
                .archive
                .handle_size_overrun(&this.entry.inner, this.expected, this.byte_count)?;
        }
        Poll::Ready(Ok(()))
    }
}

/// Running CRC-32 over the data, checked at the end of the stream.
pub(crate) struct Crc32Reader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
    expected: u32,
    checked: bool,
}

impl<R> Crc32Reader<R> {
    pub fn new(inner: R, expected: u32) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            expected,
            checked: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Crc32Reader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if fresh.is_empty() && buf.remaining() > 0 && !this.checked {
            this.checked = true;
            let actual = this.hasher.clone().finalize();
            if actual != this.expected {
                return Poll::Ready(Err(ZipError::Crc32Mismatch {
                    expected: this.expected,
                    actual,
                }
                .into()));
            }
        }
        this.hasher.update(fresh);
        Poll::Ready(Ok(()))
    }
}
