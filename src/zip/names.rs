//! Text decoding and filename rules for directory entries.

use crate::error::{ZipError, ZipResult};

use super::cp437;
use super::structures::{ExtraField, UNICODE_PATH_EXTRA_FIELD_ID};

/// General purpose flag bit marking names and comments as UTF-8.
pub const FLAG_UTF8: u16 = 0x0800;

/// Decode a header string as UTF-8 or CP437.
///
/// Invalid UTF-8 sequences are replaced rather than rejected.
pub fn decode_text(bytes: &[u8], is_utf8: bool) -> String {
    if is_utf8 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        cp437::decode(bytes)
    }
}

/// Name carried by an Info-ZIP Unicode Path extra field, if one applies.
///
/// The field is used only when its version is 1 and its CRC-32 matches the
/// raw header name, i.e. the name has not been changed since the field was
/// written.
pub fn unicode_path_name(extra_fields: &[ExtraField], raw_name: &[u8]) -> Option<String> {
    extra_fields
        .iter()
        .filter(|field| field.id == UNICODE_PATH_EXTRA_FIELD_ID)
        .filter(|field| field.data.len() >= 6 && field.data[0] == 1)
        .find(|field| {
            let name_crc = u32::from_le_bytes([field.data[1], field.data[2], field.data[3], field.data[4]]);
            crc32fast::hash(raw_name) == name_crc
        })
        .map(|field| decode_text(&field.data[5..], true))
}

/// Normalise and check a decoded filename.
///
/// Unless `strict` is set, backslashes are first rewritten as forward slashes.
/// Names containing a backslash, starting with a drive letter or a slash, or
/// containing a `..` segment are rejected.
pub fn validate_filename(name: String, strict: bool) -> ZipResult<String> {
    let name = if strict || !name.contains('\\') {
        name
    } else {
        name.replace('\\', "/")
    };

    if name.contains('\\') {
        return Err(ZipError::format(format!("Invalid characters in filename: {name}")));
    }

    let bytes = name.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if has_drive || name.starts_with('/') {
        return Err(ZipError::format(format!("Absolute path: {name}")));
    }

    if name.split('/').any(|segment| segment == "..") {
        return Err(ZipError::format(format!("Relative path: {name}")));
    }

    Ok(name)
}
