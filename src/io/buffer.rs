use super::ReadAt;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// In-memory reader over an owned byte buffer
#[derive(Clone)]
pub struct BufferReader {
    data: Arc<[u8]>,
}

impl BufferReader {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ReadAt for BufferReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Cannot read beyond end of buffer",
                )
            })?;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
