//! ZIP archive parsing and extraction.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, file headers, etc.)
//! - `parser`: Low-level parsing of ZIP structures from a byte source
//! - `quirk`: Classification of archives written with truncated fields
//! - `archive`: Locating the Central Directory and iterating entries
//! - `pipeline`: The streaming stages behind an entry's data
//! - `extractor`: High-level extraction API for end users
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! This implementation reads the EOCD first (from the end of the file), then
//! the Central Directory one header at a time, so listing never reads file
//! data.
//!
//! ## Truncated archives
//!
//! macOS Archive Utility writes archives over 4 GiB without ZIP64 records,
//! storing every size, offset and count modulo its field width. The archive
//! still parses, but the Central Directory is not where the footer says and
//! entries point at the wrong data. Such archives are detected from the
//! producer's distinctive header layout and recovered by searching at
//! multiples of 4 GiB. See [`QuirkStatus`] for how certain the result is.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for files > 4GB
//! - STORED (no compression) method
//! - DEFLATE compression method
//!
//! ## Limitations
//!
//! - No decryption
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod archive;
mod cp437;
mod entry;
mod extractor;
mod names;
mod parser;
mod pipeline;
mod quirk;
pub mod structures;

pub use archive::{ArchiveOptions, ZipArchive};
pub use entry::{ReadOptions, ZipFileEntry};
pub use extractor::ZipExtractor;
pub use pipeline::EntryReader;
pub use quirk::QuirkStatus;
pub use structures::{CompressionMethod, ExtraField};
