use super::ReadAt;
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Local file reader with random access support.
///
/// Created either from a path, in which case the file can be reopened after
/// [`ReadAt::close`], or from an already open handle, which is released for
/// good on close.
pub struct LocalFileReader {
    path: Option<PathBuf>,
    file: RwLock<Option<Arc<File>>>,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: RwLock::new(Some(Arc::new(file))),
            size,
        })
    }

    /// Wrap a file handle the caller has already opened.
    pub fn from_file(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: None,
            file: RwLock::new(Some(Arc::new(file))),
            size,
        })
    }

    fn handle(&self) -> io::Result<Arc<File>> {
        self.file
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file has been closed"))
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.handle()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.read_at(buf, offset)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            file.seek_read(buf, offset)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = (file, offset, buf);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "positional reads are not supported on this platform",
            ))
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn open(&self) -> io::Result<()> {
        let mut slot = self.file.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "file handle was closed and cannot be reopened",
            ));
        };
        let file = File::open(path)?;
        if file.metadata()?.len() != self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "file size changed since it was first opened",
            ));
        }
        *slot = Some(Arc::new(file));
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
