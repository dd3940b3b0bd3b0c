use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{ZipError, ZipResult};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;
    pub const MAX_COMMENT_SIZE: usize = 0xFFFF;

    pub fn from_bytes(data: &[u8]) -> ZipResult<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format("Invalid End of Central Directory Record"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Whether any field holds the sentinel that defers to the ZIP64 record.
    ///
    /// The per-disk entry count is not consulted; only the total count, size
    /// and offset are used by the reader.
    pub fn is_zip64(&self) -> bool {
        self.total_entries == 0xFFFF || self.cd_size == 0xFFFFFFFF || self.cd_offset == 0xFFFFFFFF
    }
}

/// Locate the End of Central Directory record inside the trailing window `buf`.
///
/// The window must end at the end of the archive. Candidates are scanned
/// backwards from the last position a record could start, and a candidate is
/// only accepted when its comment length reaches exactly to the end of the
/// window. Returns the candidate's position within `buf`.
pub fn find_eocd(buf: &[u8]) -> Option<usize> {
    let last = buf.len().checked_sub(EndOfCentralDirectory::SIZE)?;
    (0..=last).rev().find(|&pos| {
        &buf[pos..pos + 4] == EndOfCentralDirectory::SIGNATURE && {
            let comment_len = u16::from_le_bytes([buf[pos + 20], buf[pos + 21]]) as usize;
            comment_len == buf.len() - pos - EndOfCentralDirectory::SIZE
        }
    })
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    /// Parse a locator, returning `None` when the signature is absent.
    pub fn from_bytes(data: &[u8]) -> ZipResult<Option<Self>> {
        if data.len() < Self::SIZE {
            return Err(ZipError::format("Invalid ZIP64 End of Central Directory Locator"));
        }

        if &data[0..4] != Self::SIGNATURE {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Some(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        }))
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;
    /// Bytes preceding the data counted by `eocd64_size` (signature + size field).
    pub const LEADING_SIZE: u64 = 12;

    pub fn from_bytes(data: &[u8]) -> ZipResult<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format(
                "Invalid ZIP64 End of Central Directory Record signature",
            ));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Fixed part of a Central Directory File Header (CDFH) - 46 bytes
#[derive(Debug, Clone)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub lfh_offset: u32,
}

impl CentralDirectoryHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x01\x02";
    pub const SIZE: usize = 46;

    /// Parse the fixed header, returning `None` when the signature is absent.
    pub fn from_bytes(data: &[u8]) -> ZipResult<Option<Self>> {
        if data.len() < Self::SIZE {
            return Err(ZipError::format("Invalid Central Directory File Header"));
        }
        if &data[0..4] != Self::SIGNATURE {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Some(Self {
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            compression_method: cursor.read_u16::<LittleEndian>()?,
            last_mod_time: cursor.read_u16::<LittleEndian>()?,
            last_mod_date: cursor.read_u16::<LittleEndian>()?,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
            file_comment_length: cursor.read_u16::<LittleEndian>()?,
            disk_number_start: cursor.read_u16::<LittleEndian>()?,
            internal_attrs: cursor.read_u16::<LittleEndian>()?,
            external_attrs: cursor.read_u32::<LittleEndian>()?,
            lfh_offset: cursor.read_u32::<LittleEndian>()?,
        }))
    }

    /// Length of the variable part (file name, extra fields, comment).
    pub fn variable_length(&self) -> u64 {
        self.file_name_length as u64
            + self.extra_field_length as u64
            + self.file_comment_length as u64
    }
}

/// One extra field record from a header's extra field block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraField {
    pub id: u16,
    pub data: Vec<u8>,
}

/// ZIP64 Extended Information extra field id
pub const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;
/// Info-ZIP Unicode Path extra field id
pub const UNICODE_PATH_EXTRA_FIELD_ID: u16 = 0x7075;

/// Split an extra field block into its records.
///
/// Trailing bytes too short to hold a record header are ignored, matching
/// what common producers emit as padding.
pub fn parse_extra_fields(block: &[u8]) -> ZipResult<Vec<ExtraField>> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos + 4 <= block.len() {
        let id = u16::from_le_bytes([block[pos], block[pos + 1]]);
        let size = u16::from_le_bytes([block[pos + 2], block[pos + 3]]) as usize;
        let start = pos + 4;
        let end = start + size;
        if end > block.len() {
            return Err(ZipError::format(
                "Extra field length exceeds extra field buffer size",
            ));
        }
        fields.push(ExtraField {
            id,
            data: block[start..end].to_vec(),
        });
        pos = end;
    }
    Ok(fields)
}

/// Wide values carried by a ZIP64 Extended Information extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zip64Sizes {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub lfh_offset: u64,
}

impl Zip64Sizes {
    /// Replace every sentinel value in `self` with the wide value from `data`.
    ///
    /// Subfields appear in the fixed order uncompressed size, compressed size,
    /// header offset, and each one is present only when its 32-bit
    /// counterpart holds the sentinel. Fields whose 32-bit value is not a
    /// sentinel are left alone even when the extra field has room for them.
    pub fn apply_extra_field(mut self, data: &[u8]) -> ZipResult<Self> {
        let mut cursor = Cursor::new(data);
        let mut take = |what: &'static str| -> ZipResult<u64> {
            if cursor.position() + 8 > data.len() as u64 {
                return Err(ZipError::format(format!(
                    "ZIP64 Extended Information Extra Field does not include {what}"
                )));
            }
            Ok(cursor.read_u64::<LittleEndian>()?)
        };

        if self.uncompressed_size == 0xFFFFFFFF {
            self.uncompressed_size = take("uncompressed size")?;
        }
        if self.compressed_size == 0xFFFFFFFF {
            self.compressed_size = take("compressed size")?;
        }
        if self.lfh_offset == 0xFFFFFFFF {
            self.lfh_offset = take("relative header offset")?;
        }
        Ok(self)
    }

    pub fn needs_extra_field(&self) -> bool {
        self.uncompressed_size == 0xFFFFFFFF
            || self.compressed_size == 0xFFFFFFFF
            || self.lfh_offset == 0xFFFFFFFF
    }
}

/// Local File Header (LFH) - 30 bytes
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x03\x04";
    pub const SIZE: usize = 30;

    pub fn from_bytes(data: &[u8]) -> ZipResult<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format("Invalid Local File Header signature"));
        }

        let mut cursor = Cursor::new(&data[4..]);
        let version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let _last_mod_date = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            version_needed,
            flags,
            compression_method,
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            file_name_length: cursor.read_u16::<LittleEndian>()?,
            extra_field_length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Offset of the file data relative to the start of this header.
    pub fn data_start(&self) -> u64 {
        Self::SIZE as u64 + self.file_name_length as u64 + self.extra_field_length as u64
    }
}

/// Data Descriptor with signature - 16 bytes
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";
pub const DATA_DESCRIPTOR_SIZE: u64 = 16;

/// Check whether `buf` starts with a signed data descriptor carrying the
/// given CRC and low 32 bits of the sizes.
pub fn matches_data_descriptor(
    buf: &[u8],
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
) -> bool {
    let field = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    buf.len() >= DATA_DESCRIPTOR_SIZE as usize
        && &buf[0..4] == DATA_DESCRIPTOR_SIGNATURE
        && field(4) == crc32
        && field(8) == compressed_size as u32
        && field(12) == uncompressed_size as u32
}
