//! Directory entries and the streams opened on their data.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::error::{ZipError, ZipResult};

use super::archive::{ArchiveOptions, ArchiveShared};
use super::names::{FLAG_UTF8, decode_text, unicode_path_name, validate_filename};
use super::parser::RawEntry;
use super::pipeline::{self, EntryReader, StreamPlan};
use super::structures::{CentralDirectoryHeader, CompressionMethod, ExtraField};

/// General purpose flag bit for traditional PKWARE encryption.
const FLAG_ENCRYPTED: u16 = 0x0001;
/// Header prepended to traditionally encrypted data.
const ENCRYPTION_HEADER_SIZE: u64 = 12;

/// Options for [`ZipFileEntry::open_read_stream`].
///
/// Every flag left as `None` takes its default from the entry.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Inflate the data. Defaults to whether the entry is compressed.
    pub decompress: Option<bool>,
    /// Decrypt the data. Defaults to whether the entry is encrypted.
    /// Decryption is not supported, so requesting it fails.
    pub decrypt: Option<bool>,
    /// Verify the CRC-32 of the output. Defaults to on whenever the output is
    /// the uncompressed data.
    pub validate_crc32: Option<bool>,
    /// First byte of the raw data to stream.
    pub start: Option<u64>,
    /// End (exclusive) of the raw data to stream.
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UncompressedSize {
    pub value: u64,
    pub certain: bool,
}

pub(crate) struct EntryData {
    /// Position of the entry in directory order
    pub id: u64,
    pub archive: Weak<ArchiveShared>,
    pub header: CentralDirectoryHeader,
    pub raw_file_name: Vec<u8>,
    pub file_name: String,
    pub raw_comment: Vec<u8>,
    pub comment: String,
    pub extra_fields: Vec<ExtraField>,
    pub compressed_size: u64,
    pub lfh_offset: u64,
    pub is_zip64: bool,
    pub data_offset: OnceLock<u64>,
    uncompressed: Mutex<UncompressedSize>,
}

impl EntryData {
    /// Decode and validate a raw directory entry.
    ///
    /// With `decode_strings` off, names and comments are kept as lossy UTF-8
    /// renderings of the raw bytes and filenames are not validated.
    pub fn from_raw(
        raw: RawEntry,
        id: u64,
        archive: Weak<ArchiveShared>,
        options: &ArchiveOptions,
        uncompressed_size_certain: bool,
    ) -> ZipResult<Self> {
        let (file_name, comment) = if options.decode_strings {
            let is_utf8 = raw.header.flags & FLAG_UTF8 != 0;
            let mut name = unicode_path_name(&raw.extra_fields, &raw.file_name)
                .unwrap_or_else(|| decode_text(&raw.file_name, is_utf8));
            if options.validate_filenames {
                name = validate_filename(name, options.strict_filenames)?;
            }
            (name, decode_text(&raw.comment, is_utf8))
        } else {
            (
                String::from_utf8_lossy(&raw.file_name).into_owned(),
                String::from_utf8_lossy(&raw.comment).into_owned(),
            )
        };

        if options.validate_entry_sizes && raw.header.compression_method == 0 {
            let expected = if raw.header.flags & FLAG_ENCRYPTED != 0 {
                raw.uncompressed_size + ENCRYPTION_HEADER_SIZE
            } else {
                raw.uncompressed_size
            };
            if raw.compressed_size != expected {
                return Err(ZipError::format(format!(
                    "Compressed/uncompressed size mismatch for stored file: {} != {expected}",
                    raw.compressed_size
                )));
            }
        }

        Ok(Self {
            id,
            archive,
            header: raw.header,
            raw_file_name: raw.file_name,
            file_name,
            raw_comment: raw.comment,
            comment,
            extra_fields: raw.extra_fields,
            compressed_size: raw.compressed_size,
            lfh_offset: raw.lfh_offset,
            is_zip64: raw.is_zip64,
            data_offset: OnceLock::new(),
            uncompressed: Mutex::new(UncompressedSize {
                value: raw.uncompressed_size,
                certain: uncompressed_size_certain,
            }),
        })
    }

    /// Lock the correctable uncompressed size.
    ///
    /// Callers that also need the archive's directory must lock it first.
    pub fn uncompressed(&self) -> MutexGuard<'_, UncompressedSize> {
        self.uncompressed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_size_certain(&self) {
        self.uncompressed().certain = true;
    }
}

impl Drop for EntryData {
    fn drop(&mut self) {
        let certain = self
            .uncompressed
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .certain;
        if !certain && let Some(archive) = self.archive.upgrade() {
            archive.forget_uncertain_entry(self.id);
        }
    }
}

/// A file or directory entry in a ZIP archive.
///
/// Cheap to clone; clones share the correctable uncompressed size.
#[derive(Clone)]
pub struct ZipFileEntry {
    pub(crate) inner: Arc<EntryData>,
}

impl ZipFileEntry {
    /// Decoded (and, if enabled, validated) filename.
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Filename bytes exactly as stored in the directory.
    pub fn raw_file_name(&self) -> &[u8] {
        &self.inner.raw_file_name
    }

    pub fn comment(&self) -> &str {
        &self.inner.comment
    }

    pub fn raw_comment(&self) -> &[u8] {
        &self.inner.raw_comment
    }

    pub fn compression_method(&self) -> CompressionMethod {
        CompressionMethod::from_u16(self.inner.header.compression_method)
    }

    /// Size of the stored data, corrected for truncation if the archive was
    /// recovered.
    pub fn compressed_size(&self) -> u64 {
        self.inner.compressed_size
    }

    /// Size of the data once decompressed.
    ///
    /// In an archive with truncated fields this may grow by multiples of
    /// 4 GiB once a stream reads past it; see
    /// [`uncompressed_size_is_certain`](Self::uncompressed_size_is_certain).
    pub fn uncompressed_size(&self) -> u64 {
        self.inner.uncompressed().value
    }

    pub fn uncompressed_size_is_certain(&self) -> bool {
        self.inner.uncompressed().certain
    }

    pub fn crc32(&self) -> u32 {
        self.inner.header.crc32
    }

    /// Offset of the Local File Header.
    pub fn lfh_offset(&self) -> u64 {
        self.inner.lfh_offset
    }

    /// Offset of the file data, once known.
    ///
    /// Known from the directory alone in a recovered archive, otherwise
    /// resolved by the first stream opened on the entry.
    pub fn data_offset(&self) -> Option<u64> {
        self.inner.data_offset.get().copied()
    }

    pub fn flags(&self) -> u16 {
        self.inner.header.flags
    }

    pub fn version_made_by(&self) -> u16 {
        self.inner.header.version_made_by
    }

    pub fn version_needed(&self) -> u16 {
        self.inner.header.version_needed
    }

    pub fn last_mod_time(&self) -> u16 {
        self.inner.header.last_mod_time
    }

    pub fn last_mod_date(&self) -> u16 {
        self.inner.header.last_mod_date
    }

    pub fn internal_attrs(&self) -> u16 {
        self.inner.header.internal_attrs
    }

    pub fn external_attrs(&self) -> u32 {
        self.inner.header.external_attrs
    }

    pub fn extra_fields(&self) -> &[ExtraField] {
        &self.inner.extra_fields
    }

    /// Whether the directory header used the ZIP64 extra field.
    pub fn is_zip64(&self) -> bool {
        self.inner.is_zip64
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.header.flags & FLAG_ENCRYPTED != 0
    }

    /// Whether the data is compressed with any method.
    pub fn is_compressed(&self) -> bool {
        self.inner.header.compression_method != 0
    }

    /// Directory entries end with '/'
    pub fn is_directory(&self) -> bool {
        self.inner.file_name.ends_with('/')
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let date = self.inner.header.last_mod_date;
        let day = (date & 0x1F) as u8;
        let month = ((date >> 5) & 0x0F) as u8;
        let year = ((date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let time = self.inner.header.last_mod_time;
        let second = ((time & 0x1F) * 2) as u8;
        let minute = ((time >> 5) & 0x3F) as u8;
        let hour = ((time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    pub(crate) fn belongs_to(&self, archive: &Arc<ArchiveShared>) -> bool {
        std::ptr::eq(self.inner.archive.as_ptr(), Arc::as_ptr(archive))
    }

    /// Open a stream over this entry's data.
    ///
    /// All option checks happen before any I/O. The Local File Header is then
    /// read and checked, and the raw data is wired through inflation,
    /// uncompressed size checking and CRC-32 checking as requested.
    ///
    /// # Errors
    ///
    /// - [`ZipError::Usage`] for contradictory options, or if the archive has
    ///   been closed or dropped.
    /// - [`ZipError::Unsupported`] when decryption or an unknown compression
    ///   method would be needed.
    /// - [`ZipError::Format`] / [`ZipError::Consistency`] if the Local File
    ///   Header is invalid or the data lies outside the archive.
    pub async fn open_read_stream(&self, options: ReadOptions) -> ZipResult<EntryReader> {
        let archive = self
            .inner
            .archive
            .upgrade()
            .ok_or_else(|| ZipError::usage("The archive this entry belongs to has been dropped"))?;
        let plan = self.plan_stream(&options)?;

        let lfh = archive.parser.read_local_header(self.inner.lfh_offset).await?;
        archive.check_local_header(&self.inner, &lfh)?;
        let data_offset = self.inner.lfh_offset + lfh.data_start();
        let recorded = *self.inner.data_offset.get_or_init(|| data_offset);
        if recorded != data_offset {
            return Err(ZipError::consistency(format!(
                "Local File Header places data at {data_offset}, previously {recorded}"
            )));
        }

        if self.inner.compressed_size != 0 {
            let data_end = data_offset.saturating_add(self.inner.compressed_size);
            if data_end > archive.footer_offset {
                return Err(ZipError::format(format!(
                    "File data overflows file bounds: {data_offset} + {} > {}",
                    self.inner.compressed_size, archive.footer_offset
                )));
            }
        }

        let stream = archive
            .parser
            .source()
            .stream(data_offset + plan.start, plan.end - plan.start)?;
        Ok(pipeline::build(stream, plan, self, archive))
    }

    /// Resolve [`ReadOptions`] against this entry.
    fn plan_stream(&self, options: &ReadOptions) -> ZipResult<StreamPlan> {
        let encrypted = self.is_encrypted();
        let compressed = self.is_compressed();

        let decrypt = options.decrypt.map_or(encrypted, |decrypt| decrypt && encrypted);
        if decrypt {
            return Err(ZipError::unsupported("Decryption is not supported"));
        }

        let decompress = options.decompress.map_or(compressed, |decompress| decompress && compressed);
        if decompress && self.compression_method() != CompressionMethod::Deflate {
            return Err(ZipError::unsupported(format!(
                "Unsupported compression method {}",
                self.inner.header.compression_method
            )));
        }
        if decompress && encrypted {
            return Err(ZipError::usage("Cannot decompress encrypted data"));
        }

        let validate_crc32 = match options.validate_crc32 {
            None => decompress || !compressed,
            Some(true) if compressed && !decompress => {
                return Err(ZipError::usage("Cannot validate CRC32 of compressed data"));
            }
            Some(validate) => validate,
        };
        if validate_crc32 && encrypted {
            return Err(ZipError::usage("Cannot validate CRC32 of encrypted data"));
        }

        let size = self.inner.compressed_size;
        let ranged = || -> ZipResult<()> {
            if decompress {
                return Err(ZipError::usage("Cannot stream a section of file if decompressing"));
            }
            if validate_crc32 {
                return Err(ZipError::usage("Cannot validate CRC32 for a section of file"));
            }
            Ok(())
        };

        let start = options.start.unwrap_or(0);
        if start != 0 {
            ranged()?;
            if start > size {
                return Err(ZipError::usage("`start` is after end of file data"));
            }
        }
        let end = match options.end {
            None => size,
            Some(end) => {
                ranged()?;
                if end > size {
                    return Err(ZipError::usage("`end` is after end of file data"));
                }
                if end < start {
                    return Err(ZipError::usage("`end` is before `start`"));
                }
                end
            }
        };

        Ok(StreamPlan {
            decompress,
            validate_crc32,
            start,
            end,
        })
    }
}

impl fmt::Debug for ZipFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = *self.inner.uncompressed();
        f.debug_struct("ZipFileEntry")
            .field("file_name", &self.inner.file_name)
            .field("compression_method", &self.compression_method())
            .field("compressed_size", &self.inner.compressed_size)
            .field("uncompressed_size", &size.value)
            .field("uncompressed_size_is_certain", &size.certain)
            .field("crc32", &format_args!("{:#010x}", self.inner.header.crc32))
            .field("lfh_offset", &self.inner.lfh_offset)
            .finish_non_exhaustive()
    }
}
