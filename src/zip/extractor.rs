use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ZipError, ZipResult};

use super::archive::ZipArchive;
use super::entry::{ReadOptions, ZipFileEntry};

/// ZIP file extractor
///
/// Reads the whole Central Directory once, then extracts entries by
/// streaming them through the validation pipeline.
pub struct ZipExtractor {
    archive: ZipArchive,
    entries: Vec<ZipFileEntry>,
}

impl ZipExtractor {
    /// Read every entry of `archive`.
    pub async fn new(archive: ZipArchive) -> ZipResult<Self> {
        let entries = archive.entries().await?;
        Ok(Self { archive, entries })
    }

    pub fn archive(&self) -> &ZipArchive {
        &self.archive
    }

    /// List all files in the archive
    pub fn list_files(&self) -> &[ZipFileEntry] {
        &self.entries
    }

    /// Find an entry by its decoded filename.
    pub fn find_entry(&self, name: &str) -> Option<&ZipFileEntry> {
        self.entries.iter().find(|entry| entry.file_name() == name)
    }

    /// Extract file data to memory
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> ZipResult<Vec<u8>> {
        let mut reader = self
            .archive
            .open_read_stream(entry, ReadOptions::default())
            .await?;
        reader.read_to_vec().await
    }

    /// Extract file to disk
    ///
    /// Directories are created rather than written. The file is streamed, so
    /// entries larger than memory are fine.
    pub async fn extract_to_file(&self, entry: &ZipFileEntry, output_path: &Path) -> ZipResult<()> {
        if entry.is_directory() {
            fs::create_dir_all(output_path).await?;
            return Ok(());
        }

        // Create parent directories if needed
        if let Some(parent) = output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(output_path).await?;
        self.copy_entry(entry, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    /// Extract file to stdout
    pub async fn extract_to_stdout(&self, entry: &ZipFileEntry) -> ZipResult<()> {
        let mut stdout = tokio::io::stdout();
        self.copy_entry(entry, &mut stdout).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn copy_entry<W: AsyncWrite + Unpin>(&self, entry: &ZipFileEntry, writer: &mut W) -> ZipResult<u64> {
        let mut reader = self
            .archive
            .open_read_stream(entry, ReadOptions::default())
            .await?;
        tokio::io::copy(&mut reader, writer)
            .await
            .map_err(ZipError::from_stream_error)
    }
}
