//! # quirkzip
//!
//! An async ZIP reader that also reads the archives macOS Archive Utility
//! writes for content over 4 GiB, whose size, offset and count fields are
//! silently truncated.
//!
//! Archives are read through any random-access source implementing
//! [`ReadAt`]. Only the footer and Central Directory are read to list
//! entries; each entry's data is streamed on demand through decompression,
//! size checks and CRC-32 validation.
//!
//! ## Features
//!
//! - Read ZIP files from the local filesystem or memory, or any [`ReadAt`]
//! - Support for ZIP64 format (archives larger than 4GB)
//! - Support for STORED (uncompressed) and DEFLATE compression methods
//! - Transparent recovery of truncated macOS Archive Utility archives
//! - CP437 and UTF-8 filenames, with path traversal checks
//!
//! ## Example
//!
//! ```no_run
//! use quirkzip::{ArchiveOptions, ZipArchive, ZipExtractor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let archive = ZipArchive::open_path("archive.zip", ArchiveOptions::default()).await?;
//!     let extractor = ZipExtractor::new(archive).await?;
//!
//!     // List all files in the archive
//!     for file in extractor.list_files() {
//!         println!("{} ({} bytes)", file.file_name(), file.uncompressed_size());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use error::{ZipError, ZipResult};
pub use io::{BufferReader, LocalFileReader, ReadAt};
pub use zip::{
    ArchiveOptions, CompressionMethod, EntryReader, ExtraField, QuirkStatus, ReadOptions, ZipArchive, ZipExtractor,
    ZipFileEntry,
};
