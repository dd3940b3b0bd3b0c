//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from a [`ByteSource`].
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Read Central Directory headers one at a time, on demand
//! 4. For extraction, read each file's Local File Header and data
//!
//! The parser itself is stateless. Deciding *where* to look is left to
//! [`ZipArchive`](super::ZipArchive), which may probe several candidate
//! positions when an archive's directory fields are untrustworthy.

use std::sync::Arc;

use log::trace;

use crate::error::{ZipError, ZipResult};
use crate::io::{ByteSource, ReadAt};

use super::structures::*;

/// Footer of an archive as found at its end.
pub(crate) struct Footer {
    /// The End of Central Directory record
    pub eocd: EndOfCentralDirectory,
    /// Offset of the record in the archive
    pub offset: u64,
    /// Raw archive comment following the record
    pub comment: Vec<u8>,
}

/// A ZIP64 End of Central Directory record with its position.
pub(crate) struct Zip64Footer {
    pub eocd64: Zip64EOCD,
    /// Offset of the ZIP64 record
    pub offset: u64,
    /// Offset of the ZIP64 locator
    pub locator_offset: u64,
}

impl Zip64Footer {
    /// Earliest byte of the footer records.
    ///
    /// This is the start of the ZIP64 record if it directly precedes its
    /// locator, otherwise the locator itself.
    pub fn start(&self) -> u64 {
        if self.offset + self.eocd64.eocd64_size + Zip64EOCD::LEADING_SIZE == self.locator_offset {
            self.offset
        } else {
            self.locator_offset
        }
    }
}

/// A Central Directory header with its variable-length fields, before
/// strings are decoded.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub header: CentralDirectoryHeader,
    pub file_name: Vec<u8>,
    pub extra_fields: Vec<ExtraField>,
    pub comment: Vec<u8>,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub lfh_offset: u64,
    pub is_zip64: bool,
    /// Offset of the first byte after this header
    pub entry_end: u64,
}

impl RawEntry {
    pub fn compression_method(&self) -> u16 {
        self.header.compression_method
    }

    pub fn is_deflated(&self) -> bool {
        self.header.compression_method == CompressionMethod::Deflate.as_u16()
    }
}

/// Low-level ZIP file parser.
///
/// Owns the archive's [`ByteSource`] and turns byte ranges into records.
/// Every read is bounds-checked against the archive size by the source, and
/// header reads are additionally checked against the footer offset supplied
/// by the caller.
pub(crate) struct ZipParser {
    /// The underlying data source
    source: ByteSource,
}

impl ZipParser {
    /// Create a new parser for the given reader.
    ///
    /// # Arguments
    ///
    /// * `reader` - A shared reference to a reader implementing [`ReadAt`]
    pub fn new(reader: Arc<dyn ReadAt>) -> Self {
        Self {
            source: ByteSource::new(reader),
        }
    }

    /// Get a reference to the underlying byte source.
    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// The EOCD is located at the end of the ZIP file, followed only by a
    /// comment of up to 65535 bytes. The largest window that could hold the
    /// record and its comment is read in one request and searched backwards.
    ///
    /// # Returns
    ///
    /// The parsed footer with its offset and raw comment.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid EOCD can be found, or if the archive spans
    /// multiple disks.
    pub async fn find_eocd(&self) -> ZipResult<Footer> {
        let size = self.source.size();
        if size < EndOfCentralDirectory::SIZE as u64 {
            return Err(ZipError::format("End of Central Directory Record not found"));
        }

        let window = size.min((EndOfCentralDirectory::SIZE + EndOfCentralDirectory::MAX_COMMENT_SIZE) as u64);
        let window_start = size - window;
        let buf = self.source.read(window_start, window).await?;

        let pos = find_eocd(&buf)
            .ok_or_else(|| ZipError::format("End of Central Directory Record not found"))?;
        let eocd = EndOfCentralDirectory::from_bytes(&buf[pos..])?;
        if eocd.disk_number != 0 {
            return Err(ZipError::format("Multi-disk ZIP files are not supported"));
        }

        Ok(Footer {
            eocd,
            offset: window_start + pos as u64,
            comment: buf[pos + EndOfCentralDirectory::SIZE..].to_vec(),
        })
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD indicates ZIP64 extensions are needed
    /// (fields set to 0xFFFF or 0xFFFFFFFF).
    ///
    /// # Arguments
    ///
    /// * `eocd_offset` - Offset of the regular EOCD in the file
    ///
    /// # Returns
    ///
    /// The parsed ZIP64 EOCD, or `None` if there is no locator before the
    /// EOCD.
    ///
    /// # Errors
    ///
    /// Returns an error if the ZIP64 record is missing, invalid, or does not
    /// lie before its locator.
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> ZipResult<Option<Zip64Footer>> {
        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| ZipError::format("Cannot locate ZIP64 End of Central Directory Locator"))?;
        let locator_buf = self
            .source
            .read(locator_offset, Zip64EOCDLocator::SIZE as u64)
            .await?;
        let Some(locator) = Zip64EOCDLocator::from_bytes(&locator_buf)? else {
            return Ok(None);
        };

        let offset = locator.eocd64_offset;
        if offset.saturating_add(Zip64EOCD::MIN_SIZE as u64) > locator_offset {
            return Err(ZipError::format("Cannot locate ZIP64 End of Central Directory Record"));
        }

        let eocd64_buf = self.source.read(offset, Zip64EOCD::MIN_SIZE as u64).await?;
        let eocd64 = Zip64EOCD::from_bytes(&eocd64_buf)?;
        let record_end = offset
            .checked_add(eocd64.eocd64_size)
            .and_then(|end| end.checked_add(Zip64EOCD::LEADING_SIZE));
        if record_end.is_none_or(|end| end > locator_offset) {
            return Err(ZipError::format("Invalid ZIP64 End of Central Directory Record"));
        }

        Ok(Some(Zip64Footer {
            eocd64,
            offset,
            locator_offset,
        }))
    }

    /// Attempt to parse a Central Directory File Header at `offset`.
    ///
    /// Strings are left undecoded and entry sizes unvalidated.
    ///
    /// # Arguments
    ///
    /// * `offset` - Position of the candidate header
    /// * `footer_offset` - First byte of the footer records, which no header
    ///   may reach into
    ///
    /// # Returns
    ///
    /// The parsed entry, or `None` if there is no header signature at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header overlaps the footer, uses strong
    /// encryption, has malformed extra fields, or points its local header
    /// past the footer.
    pub async fn read_entry_at(&self, offset: u64, footer_offset: u64) -> ZipResult<Option<RawEntry>> {
        if offset.saturating_add(CentralDirectoryHeader::SIZE as u64) > footer_offset {
            return Err(ZipError::format("Invalid Central Directory File Header"));
        }
        trace!("probing for central directory header at {offset}");

        let fixed = self
            .source
            .read(offset, CentralDirectoryHeader::SIZE as u64)
            .await?;
        let Some(header) = CentralDirectoryHeader::from_bytes(&fixed)? else {
            return Ok(None);
        };

        if header.flags & 0x40 != 0 {
            return Err(ZipError::format("Strong encryption is not supported"));
        }

        let variable_offset = offset + CentralDirectoryHeader::SIZE as u64;
        let entry_end = variable_offset + header.variable_length();
        if entry_end > footer_offset {
            return Err(ZipError::format("Invalid Central Directory File Header"));
        }
        let variable = self
            .source
            .read(variable_offset, header.variable_length())
            .await?;

        let name_end = header.file_name_length as usize;
        let extra_end = name_end + header.extra_field_length as usize;
        let file_name = variable[..name_end].to_vec();
        let extra_fields = parse_extra_fields(&variable[name_end..extra_end])?;
        let comment = variable[extra_end..].to_vec();

        let mut sizes = Zip64Sizes {
            uncompressed_size: header.uncompressed_size as u64,
            compressed_size: header.compressed_size as u64,
            lfh_offset: header.lfh_offset as u64,
        };
        let is_zip64 = sizes.needs_extra_field();
        if is_zip64 {
            // The last ZIP64 field wins if a producer wrote more than one
            let field = extra_fields
                .iter()
                .rev()
                .find(|field| field.id == ZIP64_EXTRA_FIELD_ID)
                .ok_or_else(|| ZipError::format("Expected ZIP64 Extended Information Extra Field"))?;
            sizes = sizes.apply_extra_field(&field.data)?;
        }

        if sizes.lfh_offset.saturating_add(LocalFileHeader::SIZE as u64) > footer_offset {
            return Err(ZipError::format("Invalid location for file data"));
        }

        Ok(Some(RawEntry {
            header,
            file_name,
            extra_fields,
            comment,
            compressed_size: sizes.compressed_size,
            uncompressed_size: sizes.uncompressed_size,
            lfh_offset: sizes.lfh_offset,
            is_zip64,
            entry_end,
        }))
    }

    /// Read the fixed part of the Local File Header at `lfh_offset`.
    ///
    /// The caller computes the data offset from the header's own name and
    /// extra field lengths, which may differ from the Central Directory's.
    pub async fn read_local_header(&self, lfh_offset: u64) -> ZipResult<LocalFileHeader> {
        let buf = self
            .source
            .read(lfh_offset, LocalFileHeader::SIZE as u64)
            .await?;
        LocalFileHeader::from_bytes(&buf)
    }

    /// Check for a signed data descriptor at `offset` carrying the given
    /// values, followed by either a Local File Header or the directory.
    pub async fn probe_data_descriptor(
        &self,
        offset: u64,
        directory_offset: u64,
        entry: &RawEntry,
    ) -> ZipResult<bool> {
        trace!("probing for data descriptor at {offset}");
        let buf = self.source.read(offset, DATA_DESCRIPTOR_SIZE + 4).await?;
        let matched = matches_data_descriptor(
            &buf,
            entry.header.crc32,
            entry.compressed_size,
            entry.uncompressed_size,
        ) && (&buf[16..20] == LocalFileHeader::SIGNATURE
            || offset + DATA_DESCRIPTOR_SIZE == directory_offset);
        Ok(matched)
    }
}
