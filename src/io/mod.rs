mod buffer;
mod local;
mod source;

pub use buffer::BufferReader;
pub use local::LocalFileReader;
pub use source::{ByteSource, RangeStream};

use async_trait::async_trait;
use std::io;

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Acquire whatever the reader needs before the first read.
    ///
    /// Called by [`ByteSource::open`]; the default does nothing.
    async fn open(&self) -> io::Result<()> {
        Ok(())
    }

    /// Release the underlying medium. Called by [`ByteSource::close`].
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Fill `buf` completely from `offset`, failing on a short read.
pub(crate) async fn read_exact_at<R: ReadAt + ?Sized>(
    reader: &R,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read_at(offset + filled as u64, &mut buf[filled..])
            .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Unexpected end of file",
            ));
        }
        filled += n;
    }
    Ok(())
}
