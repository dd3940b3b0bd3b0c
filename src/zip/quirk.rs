//! Recovery of archives whose directory fields were truncated by their producer.
//!
//! macOS Archive Utility writes archives that never use the ZIP64 extension.
//! When the directory offset or size reaches 4 GiB, or the entry count reaches
//! 65536, it stores only the low 32 (or 16) bits. Entry sizes are truncated
//! the same way. Such archives are recognised by the shape of their directory
//! headers, and the true values are recovered from the layout of the file,
//! which the same producer always packs tightly.
//!
//! An archive is classified by a [`QuirkState`] that starts as either
//! `Standard`, `Suspected` or `Quirked` and may only move from `Suspected` to
//! one of the other two.

use std::collections::HashMap;
use std::sync::Weak;

use log::debug;

use crate::error::{ZipError, ZipResult};

use super::entry::EntryData;
use super::parser::RawEntry;

/// The truncation modulus of 32-bit fields.
pub const FOUR_GIB: u64 = 1 << 32;
/// The truncation modulus of 16-bit entry counts.
const ENTRY_COUNT_WRAP: u64 = 1 << 16;

pub const CDH_MIN_LENGTH: u64 = 46;
const CDH_MAX_LENGTH: u64 = CDH_MIN_LENGTH + 0xFFFF * 3;
const MAC_CDH_EXTRA_FIELD_ID: u16 = 0x5855;
const MAC_CDH_EXTRA_FIELD_LENGTH: usize = 8;
const MAC_CDH_EXTRA_FIELDS_LENGTH: u64 = MAC_CDH_EXTRA_FIELD_LENGTH as u64 + 4;
// No entry comment, at most one extra field
const CDH_MAX_LENGTH_MAC: u64 = CDH_MIN_LENGTH + 0xFFFF + MAC_CDH_EXTRA_FIELDS_LENGTH;
/// Local header extra field bytes written per directory extra field.
pub const MAC_LFH_EXTRA_FIELDS_LENGTH: u64 = 16;
/// Minimum local header size, which every later entry occupies at least.
pub const LFH_MIN_LENGTH: u64 = 30;
/// Size of the data descriptor following each deflated entry.
pub const MAC_DATA_DESCRIPTOR_LENGTH: u64 = 16;
const MAC_VERSION_MADE_BY: u16 = 789;

/// Largest ratio by which deflate can expand data.
const MAX_DEFLATE_RATIO: u64 = 1032;

/// Whether a directory entry has the shape macOS Archive Utility gives entries.
///
/// Files are deflated with a data descriptor and carry one 8-byte extra field.
/// Folders and empty files are stored, empty, and carry the same extra field.
/// Symlinks are stored, non-empty, and carry no extra field at all.
pub fn entry_maybe_mac(entry: &RawEntry) -> bool {
    let header = &entry.header;
    if header.version_made_by != MAC_VERSION_MADE_BY || !entry.comment.is_empty() || entry.is_zip64 {
        return false;
    }

    let ends_with_slash = entry.file_name.last() == Some(&b'/');
    match header.version_needed {
        20 => {
            if header.flags != 8 || header.compression_method != 8 || ends_with_slash {
                return false;
            }
        }
        10 => {
            if header.flags != 0
                || header.compression_method != 0
                || entry.uncompressed_size != entry.compressed_size
            {
                return false;
            }
            if entry.extra_fields.is_empty() {
                return entry.compressed_size != 0 && !ends_with_slash;
            }
            if entry.compressed_size != 0 || header.crc32 != 0 {
                return false;
            }
        }
        _ => return false,
    }

    matches!(
        entry.extra_fields.as_slice(),
        [field] if field.id == MAC_CDH_EXTRA_FIELD_ID && field.data.len() == MAC_CDH_EXTRA_FIELD_LENGTH
    )
}

/// [`entry_maybe_mac`] for the first entry, whose local header is always at 0.
pub fn first_entry_maybe_mac(entry: &RawEntry) -> bool {
    entry.lfh_offset == 0 && entry_maybe_mac(entry)
}

/// Whether `directory_remaining` bytes are too few to hold 65536 more
/// entries than the `remaining` still expected.
pub fn entry_count_is_certain(remaining: i64, directory_remaining: i64) -> bool {
    (remaining + ENTRY_COUNT_WRAP as i64) * CDH_MIN_LENGTH as i64 > directory_remaining
}

/// Raise an entry count that is too low to fill the remaining directory.
///
/// `remaining` entries of at most the maximum header length must be able to
/// cover `directory_remaining` bytes. If they cannot, the count was
/// truncated, and it is raised by the smallest multiple of 65536 reaching the
/// minimum number of quirked-archive headers the space requires. The maximum
/// length used for the first check depends on whether the archive is already
/// known to be quirked.
///
/// Returns the raised count, or `None` if the count is plausible.
pub fn raised_entry_count(entry_count: u64, remaining: i64, directory_remaining: i64, quirked: bool) -> Option<u64> {
    let max_length = if quirked { CDH_MAX_LENGTH_MAC } else { CDH_MAX_LENGTH } as i64;
    if remaining * max_length >= directory_remaining {
        return None;
    }

    let min_remaining = (directory_remaining + CDH_MAX_LENGTH_MAC as i64 - 1) / CDH_MAX_LENGTH_MAC as i64;
    let shortfall = (min_remaining - remaining) as u64;
    let raise = shortfall.div_ceil(ENTRY_COUNT_WRAP) * ENTRY_COUNT_WRAP;
    Some(entry_count + raise)
}

/// Whether a deflated entry's uncompressed size could be 4 GiB or more above
/// what its header reports.
pub fn deflated_size_is_certain(compressed_size: u64, uncompressed_size: u64) -> bool {
    let max_uncompressed = compressed_size.saturating_mul(MAX_DEFLATE_RATIO);
    !(max_uncompressed > FOUR_GIB * 2
        || (max_uncompressed > FOUR_GIB && max_uncompressed % FOUR_GIB > uncompressed_size))
}

/// Classification of an archive, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkStatus {
    /// The directory fields are exactly as stored
    Standard,
    /// The first entry matches the quirked producer, but nothing confirms it yet
    Suspected,
    /// Confirmed as written by the quirked producer
    Quirked,
}

/// Bookkeeping that only exists while the archive may be quirked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tracking {
    /// Offset of the next Local File Header if the archive is quirked
    pub file_cursor: u64,
    entry_count_certain: bool,
    compressed_sizes_certain: bool,
}

impl Tracking {
    pub fn new(entry_count_certain: bool, compressed_sizes_certain: bool) -> Self {
        Self {
            file_cursor: 0,
            entry_count_certain,
            compressed_sizes_certain,
        }
    }
}

/// Entries read while suspected whose uncompressed size is not yet known.
///
/// Holds non-owning handles. An entry removes itself when dropped, and dead
/// handles left behind by a contended removal are swept out on registration.
#[derive(Default)]
pub(crate) struct UncertainEntries {
    entries: HashMap<u64, Weak<EntryData>>,
}

impl UncertainEntries {
    pub fn register(&mut self, id: u64, entry: Weak<EntryData>) {
        self.sweep();
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Forget every entry that has been dropped.
    pub fn sweep(&mut self) {
        self.entries.retain(|_, entry| entry.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Mark every live entry's uncompressed size as certain.
    fn resolve_all(self) {
        for entry in self.entries.into_values().filter_map(|entry| entry.upgrade()) {
            entry.mark_size_certain();
        }
    }
}

/// Classification state machine.
pub(crate) enum QuirkState {
    Standard,
    Suspected {
        tracking: Tracking,
        directory_size_certain: bool,
        uncertain: UncertainEntries,
    },
    Quirked {
        tracking: Tracking,
    },
}

impl QuirkState {
    pub fn status(&self) -> QuirkStatus {
        match self {
            QuirkState::Standard => QuirkStatus::Standard,
            QuirkState::Suspected { .. } => QuirkStatus::Suspected,
            QuirkState::Quirked { .. } => QuirkStatus::Quirked,
        }
    }

    pub fn tracking(&self) -> Option<&Tracking> {
        match self {
            QuirkState::Standard => None,
            QuirkState::Suspected { tracking, .. } | QuirkState::Quirked { tracking } => Some(tracking),
        }
    }

    fn tracking_mut(&mut self) -> Option<&mut Tracking> {
        match self {
            QuirkState::Standard => None,
            QuirkState::Suspected { tracking, .. } | QuirkState::Quirked { tracking } => Some(tracking),
        }
    }
}

/// Location and iteration state of the Central Directory.
pub(crate) struct Directory {
    pub entry_count: u64,
    pub offset: u64,
    pub size: u64,
    pub footer_offset: u64,
    /// Offset of the next Central Directory header
    pub entry_cursor: u64,
    pub entries_read: u64,
    /// Header already parsed while locating the directory
    pub first_entry: Option<RawEntry>,
    pub state: QuirkState,
}

impl Directory {
    /// Saturates so an impossible end still fails the footer bound.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn is_quirked(&self) -> bool {
        matches!(self.state, QuirkState::Quirked { .. })
    }

    pub fn is_suspected(&self) -> bool {
        matches!(self.state, QuirkState::Suspected { .. })
    }

    pub fn entry_count_certain(&self) -> bool {
        self.state.tracking().is_none_or(|t| t.entry_count_certain)
    }

    pub fn directory_size_certain(&self) -> bool {
        match &self.state {
            QuirkState::Suspected {
                directory_size_certain,
                ..
            } => *directory_size_certain,
            _ => true,
        }
    }

    pub fn compressed_sizes_certain(&self) -> bool {
        self.state.tracking().is_none_or(|t| t.compressed_sizes_certain)
    }

    /// Uncompressed sizes are only trustworthy once the archive is known standard.
    pub fn uncompressed_sizes_certain(&self) -> bool {
        matches!(self.state, QuirkState::Standard)
    }

    pub fn file_cursor(&self) -> Option<u64> {
        self.state.tracking().map(|t| t.file_cursor)
    }

    pub fn set_file_cursor(&mut self, cursor: u64) {
        if let Some(tracking) = self.state.tracking_mut() {
            tracking.file_cursor = cursor;
        }
    }

    pub fn resolve_compressed_sizes(&mut self) {
        if let Some(tracking) = self.state.tracking_mut() {
            tracking.compressed_sizes_certain = true;
        }
    }

    pub fn uncertain_entries_mut(&mut self) -> Option<&mut UncertainEntries> {
        match &mut self.state {
            QuirkState::Suspected { uncertain, .. } => Some(uncertain),
            _ => None,
        }
    }

    /// Raise the entry count if it is too low for the directory left after
    /// `entries_read` entries ending at `cursor`. Returns whether it was raised.
    pub fn recalculate_entry_count(&mut self, entries_read: u64, cursor: u64) -> bool {
        let remaining = self.entry_count as i64 - entries_read as i64;
        let directory_remaining = self.end() as i64 - cursor as i64;
        match raised_entry_count(self.entry_count, remaining, directory_remaining, self.is_quirked()) {
            Some(count) => {
                debug!("raising entry count from {} to {count}", self.entry_count);
                self.entry_count = count;
                true
            }
            None => false,
        }
    }

    /// Mark the entry count certain if no 65536 further entries could fit.
    ///
    /// Only meaningful once the directory size is certain.
    pub fn recalculate_entry_count_is_certain(&mut self, entries_read: u64, cursor: u64) {
        let remaining = self.entry_count as i64 - entries_read as i64;
        let directory_remaining = self.end() as i64 - cursor as i64;
        if entry_count_is_certain(remaining, directory_remaining)
            && let Some(tracking) = self.state.tracking_mut()
        {
            tracking.entry_count_certain = true;
        }
    }

    /// A suspected archive turned out to be quirked.
    ///
    /// The directory grows to the footer if its size was uncertain, and the
    /// entry count is recalculated. Entries still awaiting a size resolution
    /// stay uncertain but are no longer tracked. Does nothing if already
    /// quirked.
    ///
    /// # Errors
    ///
    /// Fails if the archive was already classified as standard, which means
    /// contradictory evidence was found.
    pub fn set_as_quirked(&mut self, entries_read: u64, cursor: u64) -> ZipResult<()> {
        let state = std::mem::replace(&mut self.state, QuirkState::Standard);
        let (tracking, directory_size_certain) = match state {
            QuirkState::Suspected {
                tracking,
                directory_size_certain,
                ..
            } => (tracking, directory_size_certain),
            QuirkState::Quirked { .. } => {
                self.state = state;
                return Ok(());
            }
            QuirkState::Standard => {
                return Err(ZipError::consistency(
                    "archive classified as standard shows truncated fields",
                ));
            }
        };

        debug!("archive confirmed as macOS Archive Utility ZIP after {entries_read} entries");
        self.state = QuirkState::Quirked { tracking };
        if !directory_size_certain {
            self.size = self.footer_offset - self.offset;
        }
        if !tracking.entry_count_certain {
            self.recalculate_entry_count(entries_read, cursor);
            self.recalculate_entry_count_is_certain(entries_read, cursor);
        }
        Ok(())
    }

    /// A suspected archive turned out to be standard.
    ///
    /// Every size and count is certain from now on, including the
    /// uncompressed sizes of entries already handed out. Does nothing unless
    /// the archive is suspected.
    pub fn set_as_standard(&mut self) {
        if !self.is_suspected() {
            return;
        }
        if let QuirkState::Suspected { uncertain, .. } = std::mem::replace(&mut self.state, QuirkState::Standard) {
            debug!("archive confirmed as standard, resolving {} uncertain entries", uncertain.len());
            uncertain.resolve_all();
        }
    }
}
