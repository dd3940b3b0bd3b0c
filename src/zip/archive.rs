//! The archive index: locating the Central Directory and iterating entries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::error::{ZipError, ZipResult};
use crate::io::{BufferReader, LocalFileReader, ReadAt};

use super::entry::{EntryData, ReadOptions, ZipFileEntry};
use super::parser::{RawEntry, ZipParser};
use super::pipeline::EntryReader;
use super::quirk::*;
use super::structures::LocalFileHeader;

/// Options controlling how an archive is read.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Decode filenames and comments from UTF-8 or CP437.
    pub decode_strings: bool,
    /// Check stored entries' sizes agree, and check uncompressed sizes while
    /// streaming.
    pub validate_entry_sizes: bool,
    /// Reject absolute paths and `..` segments. Requires `decode_strings`.
    pub validate_filenames: bool,
    /// Reject backslashes instead of treating them as path separators.
    pub strict_filenames: bool,
    /// Recover archives written by macOS Archive Utility with truncated
    /// sizes, offsets and entry counts.
    pub support_mac_archive: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            decode_strings: true,
            validate_entry_sizes: true,
            validate_filenames: true,
            strict_filenames: false,
            support_mac_archive: true,
        }
    }
}

/// State shared between an archive handle, its entries and their streams.
pub(crate) struct ArchiveShared {
    pub parser: ZipParser,
    pub options: ArchiveOptions,
    /// First byte of the footer records
    pub footer_offset: u64,
    pub is_zip64: bool,
    raw_comment: Vec<u8>,
    comment: String,
    directory: Mutex<Directory>,
    reading: AtomicBool,
}

/// Summary values read from the footer records.
struct FooterSummary {
    entry_count: u64,
    offset: u64,
    size: u64,
    footer_offset: u64,
    is_zip64: bool,
    has_comment: bool,
}

impl ArchiveShared {
    pub fn directory(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a dropped entry from the uncertain set.
    ///
    /// Skipped when the directory is locked, since the lock holder may be
    /// the one dropping the entry. The handle left behind is dead and goes
    /// at the next sweep.
    pub fn forget_uncertain_entry(&self, id: u64) {
        if let Ok(mut dir) = self.directory.try_lock()
            && let Some(uncertain) = dir.uncertain_entries_mut()
        {
            uncertain.remove(id);
        }
    }

    #[cfg(test)]
    pub fn uncertain_entry_count(&self) -> usize {
        self.directory()
            .uncertain_entries_mut()
            .map_or(0, |uncertain| uncertain.len())
    }

    /// Check a Local File Header against the quirked producer's layout.
    ///
    /// Its headers carry no CRC or sizes, the directory's filename, and 16
    /// extra field bytes per directory extra field. A mismatch in a confirmed
    /// quirked archive is corruption; in a suspected one it proves the
    /// archive standard.
    pub fn check_local_header(&self, entry: &EntryData, lfh: &LocalFileHeader) -> ZipResult<()> {
        let mut dir = self.directory();
        if !dir.is_quirked() && !dir.is_suspected() {
            return Ok(());
        }

        let matches = lfh.crc32 == 0
            && lfh.compressed_size == 0
            && lfh.uncompressed_size == 0
            && lfh.file_name_length == entry.header.file_name_length
            && lfh.extra_field_length as u64 == entry.extra_fields.len() as u64 * MAC_LFH_EXTRA_FIELDS_LENGTH;
        if dir.is_quirked() {
            if !matches {
                return Err(ZipError::consistency("Misidentified Mac OS Archive Utility ZIP"));
            }
        } else if !matches {
            dir.set_as_standard();
        }
        Ok(())
    }

    /// Reconcile a stream that produced more bytes than expected.
    ///
    /// Returns the new expected size.
    pub fn handle_size_overrun(&self, entry: &EntryData, mut expected: u64, actual: u64) -> ZipResult<u64> {
        let mut dir = self.directory();
        while actual > expected {
            let mut size = entry.uncompressed();
            if size.value > expected {
                // Another stream of the same entry already corrected it
                expected = size.value;
                continue;
            }
            if size.certain {
                return Err(ZipError::TooManyBytes { expected, actual });
            }

            expected += FOUR_GIB;
            size.value = expected;
            drop(size);
            debug!("uncompressed size of entry {} raised to {expected}", entry.id);

            if !dir.is_quirked() {
                if !dir.is_suspected() {
                    return Err(ZipError::consistency(
                        "uncompressed size exceeded in an archive classified as standard",
                    ));
                }
                let (entries_read, cursor) = (dir.entries_read, dir.entry_cursor);
                dir.set_as_quirked(entries_read, cursor)?;
            }
        }
        Ok(expected)
    }

    /// A stream reached the end of an entry with the expected size, which is
    /// therefore now certain.
    pub fn resolve_entry_size(&self, entry: &EntryData) {
        let mut dir = self.directory();
        let mut size = entry.uncompressed();
        if size.certain {
            return;
        }
        size.certain = true;
        drop(size);
        if let Some(uncertain) = dir.uncertain_entries_mut() {
            uncertain.remove(entry.id);
        }
    }

    async fn read_entry(self: &Arc<Self>) -> ZipResult<Option<ZipFileEntry>> {
        let (cached, cursor) = {
            let dir = self.directory();
            if dir.entries_read == dir.entry_count && dir.entry_count_certain() {
                return Ok(None);
            }
            (dir.first_entry.clone(), dir.entry_cursor)
        };

        let mut raw = match cached {
            Some(raw) => raw,
            None => {
                let found = if cursor + CDH_MIN_LENGTH > self.footer_offset {
                    None
                } else {
                    self.parser.read_entry_at(cursor, self.footer_offset).await?
                };
                let mut dir = self.directory();
                match found {
                    Some(raw) => check_next_entry(&mut dir, raw)?,
                    None => {
                        // Only reachable when the count was uncertain and the
                        // directory turns out to end exactly where stated
                        if dir.is_quirked() || dir.entries_read != dir.entry_count || cursor != dir.end() {
                            return Err(ZipError::format("Invalid Central Directory File Header signature"));
                        }
                        dir.set_as_standard();
                        return Ok(None);
                    }
                }
            }
        };

        let data_offset_if_mac = raw.lfh_offset
            + LFH_MIN_LENGTH
            + raw.file_name.len() as u64
            + raw.extra_fields.len() as u64 * MAC_LFH_EXTRA_FIELDS_LENGTH;

        let compressed_sizes_certain = self.directory().compressed_sizes_certain();
        if !compressed_sizes_certain && self.determine_compressed_size(&mut raw, data_offset_if_mac).await? {
            self.directory().resolve_compressed_sizes();
        }

        let mut dir = self.directory();
        let mut size_certain = true;
        if !dir.uncompressed_sizes_certain() {
            match raw.compression_method() {
                0 => raw.uncompressed_size = raw.compressed_size,
                8 => size_certain = deflated_size_is_certain(raw.compressed_size, raw.uncompressed_size),
                _ => size_certain = false,
            }
        }

        let id = dir.entries_read;
        let entry_end = raw.entry_end;
        let is_deflated = raw.is_deflated();
        let data = Arc::new(EntryData::from_raw(
            raw,
            id,
            Arc::downgrade(self),
            &self.options,
            size_certain,
        )?);

        dir.first_entry = None;
        dir.entry_cursor = entry_end;
        dir.entries_read += 1;

        if dir.file_cursor().is_some() {
            let descriptor = if is_deflated { MAC_DATA_DESCRIPTOR_LENGTH } else { 0 };
            dir.set_file_cursor(data_offset_if_mac + data.compressed_size + descriptor);

            if dir.is_quirked() {
                let _ = data.data_offset.set(data_offset_if_mac);
            } else if !size_certain && let Some(uncertain) = dir.uncertain_entries_mut() {
                uncertain.register(id, Arc::downgrade(&data));
            }
        }

        Ok(Some(ZipFileEntry { inner: data }))
    }

    /// Find the true compressed size of an entry in a possibly quirked archive.
    ///
    /// Corrects `raw.compressed_size` if the data turns out to be larger than
    /// stated. Returns whether the compressed sizes of all later entries are
    /// now certain.
    ///
    /// Other operations may resolve the archive's classification while this
    /// one waits on I/O, so the classification is re-read after every read.
    async fn determine_compressed_size(&self, raw: &mut RawEntry, data_offset: u64) -> ZipResult<bool> {
        let descriptor = if raw.is_deflated() { MAC_DATA_DESCRIPTOR_LENGTH } else { 0 };
        let (remaining, directory_offset, quirked) = {
            let dir = self.directory();
            (
                dir.entry_count as i64 - dir.entries_read as i64 - 1,
                dir.offset,
                dir.is_quirked(),
            )
        };

        let data_space = directory_offset as i64 - data_offset as i64 - raw.compressed_size as i64 - descriptor as i64;
        if data_space - remaining * (LFH_MIN_LENGTH as i64) < FOUR_GIB as i64 {
            return Ok(true);
        }

        if quirked && remaining == 0 {
            // The last entry of a quirked archive fills the space up to the directory
            if data_space % FOUR_GIB as i64 != 0 {
                return Err(ZipError::consistency("Invalid ZIP structure for Mac OS Archive Utility ZIP"));
            }
            raw.compressed_size += data_space as u64;
            return Ok(true);
        }

        if raw.compression_method() == 0 {
            // Folders, empty files and symlinks: no descriptor to search for
            return Ok(false);
        }

        let stated_end = data_offset + raw.compressed_size;
        let mut data_end = stated_end;
        let found = loop {
            if self.parser.probe_data_descriptor(data_end, directory_offset, raw).await? {
                break Some(data_end);
            }
            if self.directory().compressed_sizes_certain() {
                // Resolved by another operation, so the stated size stands
                return Ok(true);
            }
            data_end += FOUR_GIB;
            if data_end + MAC_DATA_DESCRIPTOR_LENGTH > directory_offset {
                break None;
            }
        };

        let mut dir = self.directory();
        let Some(data_end) = found else {
            if dir.is_quirked() {
                return Err(ZipError::consistency("Cannot locate file Data Descriptor"));
            }
            dir.set_as_standard();
            return Ok(true);
        };

        if data_end == stated_end {
            return Ok(false);
        }

        if !dir.is_quirked() {
            if !dir.is_suspected() {
                return Err(ZipError::consistency("Cannot locate file Data Descriptor"));
            }
            let entries_read = dir.entries_read + 1;
            dir.set_as_quirked(entries_read, raw.entry_end)?;
        }
        raw.compressed_size = data_end - data_offset;
        debug!("compressed size of {:?} corrected to {}", String::from_utf8_lossy(&raw.file_name), raw.compressed_size);

        let remaining = dir.entry_count as i64 - dir.entries_read as i64 - 1;
        let data_space = directory_offset as i64 - data_end as i64 - MAC_DATA_DESCRIPTOR_LENGTH as i64;
        Ok(data_space - remaining * (LFH_MIN_LENGTH as i64) < FOUR_GIB as i64)
    }
}

/// Check an entry read beyond the first against the archive's classification.
fn check_next_entry(dir: &mut Directory, mut raw: RawEntry) -> ZipResult<RawEntry> {
    let Some(file_cursor) = dir.file_cursor() else {
        return Ok(raw);
    };
    let entries_read = dir.entries_read + 1;
    let entry_end = raw.entry_end;
    let at_cursor_low_bits = raw.lfh_offset == file_cursor % FOUR_GIB;

    if dir.is_quirked() {
        // Every entry of a quirked archive has the producer's shape, and its
        // data directly follows the previous entry's
        if !entry_maybe_mac(&raw) || !at_cursor_low_bits {
            return Err(ZipError::consistency("Inconsistent Central Directory structure"));
        }
        raw.lfh_offset = file_cursor;
        if !dir.entry_count_certain() {
            dir.recalculate_entry_count(entries_read, entry_end);
            dir.recalculate_entry_count_is_certain(entries_read, entry_end);
        }
        return Ok(raw);
    }

    if file_cursor >= FOUR_GIB {
        // Data up to the cursor is taken, so a 32-bit header offset can only
        // be correct if it was truncated
        if !entry_maybe_mac(&raw) || !at_cursor_low_bits {
            return Err(ZipError::consistency("Inconsistent Central Directory structure"));
        }
        raw.lfh_offset = file_cursor;
        dir.set_as_quirked(entries_read, entry_end)?;
    } else if !entry_maybe_mac(&raw) || raw.lfh_offset != file_cursor {
        dir.set_as_standard();
        if dir.entries_read == dir.entry_count {
            return Err(ZipError::consistency("Central Directory contains too many entries"));
        }
    } else if !dir.directory_size_certain()
        && entry_end as i64 + (dir.entry_count as i64 - entries_read as i64) * CDH_MIN_LENGTH as i64
            > dir.end() as i64
    {
        // The remaining entries cannot fit in the stated directory
        dir.set_as_quirked(entries_read, entry_end)?;
    } else if !dir.entry_count_certain() {
        if dir.recalculate_entry_count(entries_read, entry_end) {
            dir.set_as_quirked(entries_read, entry_end)?;
        } else if dir.directory_size_certain() {
            dir.recalculate_entry_count_is_certain(entries_read, entry_end);
        }
    }
    Ok(raw)
}

/// Locate the Central Directory, recovering truncated footer fields.
///
/// A standard archive is recognised by its first directory header, found
/// where the footer says. Otherwise the directory is searched for at the
/// stated offset plus multiples of 4 GiB, and the archive is classified as
/// quirked or merely suspected depending on how much of the footer proved
/// wrong.
async fn locate_central_directory(
    parser: &ZipParser,
    options: &ArchiveOptions,
    summary: FooterSummary,
) -> ZipResult<Directory> {
    let FooterSummary {
        mut entry_count,
        mut offset,
        mut size,
        footer_offset,
        ..
    } = summary;
    let standard = |entry_count, offset, size, first_entry| Directory {
        entry_count,
        offset,
        size,
        footer_offset,
        entry_cursor: offset,
        entries_read: 0,
        first_entry,
        state: QuirkState::Standard,
    };
    let inconsistent = || ZipError::consistency("Inconsistent Central Directory size and entry count");

    // The producer never writes ZIP64 records or comments, and always places
    // the directory directly before the footer
    let mut directory_end = offset
        .checked_add(size)
        .ok_or_else(|| ZipError::format("Invalid Central Directory offset"))?;
    if !options.support_mac_archive
        || summary.is_zip64
        || summary.has_comment
        || directory_end % FOUR_GIB != footer_offset % FOUR_GIB
    {
        return Ok(standard(entry_count, offset, size, None));
    }

    if entry_count == 0 && offset + CDH_MIN_LENGTH > footer_offset {
        if size != 0 {
            return Err(inconsistent());
        }
        return Ok(standard(entry_count, offset, size, None));
    }

    let mut is_mac = false;
    if size < entry_count * CDH_MIN_LENGTH {
        if directory_end >= footer_offset {
            return Err(inconsistent());
        }
        debug!("directory of {size} bytes cannot hold {entry_count} entries");
        is_mac = true;
        directory_end = footer_offset;
        size = directory_end - offset;
    }

    if let Some(raised) = raised_entry_count(entry_count, entry_count as i64, size as i64, is_mac) {
        debug!("entry count {entry_count} too low for a {size} byte directory");
        entry_count = raised;
        is_mac = true;
    }

    let mut entry = None;
    let mut already_checked = None;
    if !is_mac {
        entry = parser.read_entry_at(offset, footer_offset).await?;
        if let Some(first) = &entry
            && !first_entry_maybe_mac(first)
        {
            if entry_count == 0 {
                return Err(inconsistent());
            }
            return Ok(standard(entry_count, offset, size, entry));
        }
        already_checked = Some(offset);
    }

    if entry.is_none() {
        // Quirked archives more often hold large files than millions of
        // entries, so start from the last possible position
        let last_start = footer_offset as i64 - size.max(entry_count * CDH_MIN_LENGTH) as i64;
        if last_start < 0 {
            return Err(inconsistent());
        }
        let mut candidate = last_start as u64;
        if candidate % FOUR_GIB < offset {
            candidate = candidate.checked_sub(FOUR_GIB).ok_or_else(inconsistent)?;
        }
        let mut candidate = Some(candidate / FOUR_GIB * FOUR_GIB + offset);

        while let Some(position) = candidate
            && already_checked.is_none_or(|checked| position > checked)
        {
            if position + CDH_MIN_LENGTH <= footer_offset
                && let Some(found) = parser.read_entry_at(position, footer_offset).await?
            {
                if !first_entry_maybe_mac(&found) {
                    return Err(ZipError::consistency("Cannot locate Central Directory"));
                }
                debug!("central directory found at {position}, stated {offset}");
                is_mac = true;
                offset = position;
                entry = Some(found);
                break;
            }
            candidate = position.checked_sub(FOUR_GIB);
        }
    }

    let Some(first) = entry else {
        if entry_count != 0 || size != 0 {
            return Err(ZipError::consistency("Cannot locate Central Directory"));
        }
        return Ok(standard(entry_count, offset, size, None));
    };

    if entry_count == 0 {
        is_mac = true;
    }

    let mut dir = Directory {
        entry_count,
        offset,
        size,
        footer_offset,
        entry_cursor: offset,
        entries_read: 0,
        first_entry: None,
        state: QuirkState::Standard,
    };

    let mut entry_count_certain = true;
    if is_mac {
        dir.size = footer_offset - offset;
        directory_end = footer_offset;
        if dir.size == 0 {
            return Err(inconsistent());
        }
        // Quirked placeholder so the recount uses the producer's header limits
        dir.state = QuirkState::Quirked {
            tracking: Tracking::new(true, true),
        };
        dir.recalculate_entry_count(1, first.entry_end);

        // Every entry needs a directory header, and the first entry's data is
        // preceded by a local header repeating its name
        let min_total_data = dir.entry_count * CDH_MIN_LENGTH
            + first.compressed_size
            + first.file_name.len() as u64
            + first.extra_fields.len() as u64 * MAC_LFH_EXTRA_FIELDS_LENGTH;
        let compressed_sizes_certain = min_total_data + FOUR_GIB > dir.offset;
        if !entry_count_is_certain(dir.entry_count as i64 - 1, directory_end as i64 - first.entry_end as i64) {
            entry_count_certain = false;
        }
        debug!("archive identified as macOS Archive Utility ZIP");
        dir.state = QuirkState::Quirked {
            tracking: Tracking::new(entry_count_certain, compressed_sizes_certain),
        };
    } else {
        let directory_size_certain = directory_end >= footer_offset;
        if directory_size_certain {
            dir.recalculate_entry_count(1, first.entry_end);
        } else {
            // 4 GiB more directory could hold millions more entries
            entry_count_certain = false;
        }
        if entry_count_certain
            && !entry_count_is_certain(dir.entry_count as i64 - 1, directory_end as i64 - first.entry_end as i64)
        {
            entry_count_certain = false;
        }
        debug!("archive suspected to be a macOS Archive Utility ZIP");
        dir.state = QuirkState::Suspected {
            tracking: Tracking::new(entry_count_certain, true),
            directory_size_certain,
            uncertain: UncertainEntries::default(),
        };
    }

    dir.first_entry = Some(first);
    Ok(dir)
}

/// Guard marking a [`ZipArchive::next_entry`] call as in progress.
struct ReadingGuard<'a>(&'a AtomicBool);

impl<'a> ReadingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> ZipResult<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(ZipError::usage(
                "Cannot call `next_entry()` before the previous call has completed",
            ));
        }
        Ok(Self(flag))
    }
}

impl Drop for ReadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A ZIP archive opened for reading.
///
/// Entries are read one at a time, in directory order, with
/// [`next_entry`](Self::next_entry). Archives written by macOS Archive
/// Utility, whose footer and directory fields may be truncated to 32 (or 16)
/// bits, are recovered transparently unless
/// [`ArchiveOptions::support_mac_archive`] is off. While such an archive is
/// only suspected, some sizes and counts stay provisional; see
/// [`quirk_status`](Self::quirk_status).
///
/// ## Example
///
/// ```no_run
/// use quirkzip::{ArchiveOptions, ReadOptions, ZipArchive};
///
/// # async fn run() -> quirkzip::ZipResult<()> {
/// let archive = ZipArchive::open_path("archive.zip", ArchiveOptions::default()).await?;
/// while let Some(entry) = archive.next_entry().await? {
///     if entry.file_name() == "manifest.json" {
///         let mut stream = entry.open_read_stream(ReadOptions::default()).await?;
///         let data = stream.read_to_vec().await?;
///         println!("{}", String::from_utf8_lossy(&data));
///     }
/// }
/// archive.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ZipArchive {
    pub(crate) shared: Arc<ArchiveShared>,
}

impl ZipArchive {
    /// Open an archive over any [`ReadAt`] source.
    ///
    /// Opens the source, finds the footer and the Central Directory. On
    /// failure the source is closed again.
    pub async fn open(reader: Arc<dyn ReadAt>, options: ArchiveOptions) -> ZipResult<Self> {
        let parser = ZipParser::new(reader);
        parser.source().open().await?;

        match Self::init(parser, options).await {
            Ok(archive) => Ok(archive),
            Err((err, parser)) => {
                let _ = parser.source().close().await;
                Err(err)
            }
        }
    }

    /// Open the archive at `path`.
    pub async fn open_path(path: impl AsRef<Path>, options: ArchiveOptions) -> ZipResult<Self> {
        let reader = LocalFileReader::new(path.as_ref())?;
        Self::open(Arc::new(reader), options).await
    }

    /// Open an archive from an already open file handle.
    pub async fn from_file(file: std::fs::File, options: ArchiveOptions) -> ZipResult<Self> {
        let reader = LocalFileReader::from_file(file)?;
        Self::open(Arc::new(reader), options).await
    }

    /// Open an archive held in memory.
    pub async fn from_buffer(data: impl Into<Arc<[u8]>>, options: ArchiveOptions) -> ZipResult<Self> {
        Self::open(Arc::new(BufferReader::new(data)), options).await
    }

    async fn init(parser: ZipParser, options: ArchiveOptions) -> Result<Self, (ZipError, ZipParser)> {
        let (summary, raw_comment) = match Self::read_footer(&parser, &options).await {
            Ok(found) => found,
            Err(err) => return Err((err, parser)),
        };

        let footer_offset = summary.footer_offset;
        let is_zip64 = summary.is_zip64;
        let directory = match locate_central_directory(&parser, &options, summary).await {
            Ok(directory) => directory,
            Err(err) => return Err((err, parser)),
        };

        if let Err(err) = check_directory_bounds(&directory) {
            return Err((err, parser));
        }

        let comment = if options.decode_strings {
            super::cp437::decode(&raw_comment)
        } else {
            String::from_utf8_lossy(&raw_comment).into_owned()
        };

        Ok(Self {
            shared: Arc::new(ArchiveShared {
                parser,
                options,
                footer_offset,
                is_zip64,
                raw_comment,
                comment,
                directory: Mutex::new(directory),
                reading: AtomicBool::new(false),
            }),
        })
    }

    async fn read_footer(parser: &ZipParser, options: &ArchiveOptions) -> ZipResult<(FooterSummary, Vec<u8>)> {
        let footer = parser.find_eocd().await?;
        let eocd = &footer.eocd;
        let mut summary = FooterSummary {
            entry_count: eocd.total_entries as u64,
            offset: eocd.cd_offset as u64,
            size: eocd.cd_size as u64,
            footer_offset: footer.offset,
            is_zip64: eocd.is_zip64(),
            has_comment: !footer.comment.is_empty(),
        };

        if summary.is_zip64 {
            match parser.read_zip64_eocd(footer.offset).await? {
                Some(zip64) => {
                    if eocd.total_entries == 0xFFFF {
                        summary.entry_count = zip64.eocd64.total_entries;
                    }
                    if eocd.cd_size == 0xFFFFFFFF {
                        summary.size = zip64.eocd64.cd_size;
                    }
                    if eocd.cd_offset == 0xFFFFFFFF {
                        summary.offset = zip64.eocd64.cd_offset;
                    }
                    summary.footer_offset = zip64.start();
                }
                None if options.support_mac_archive => {
                    // A truncated count of exactly 65535 (or size/offset of
                    // 4 GiB - 1) looks like a ZIP64 sentinel
                    warn!("ZIP64 sentinel without a ZIP64 locator, reading footer values literally");
                    summary.is_zip64 = false;
                }
                None => {
                    return Err(ZipError::format(
                        "Invalid ZIP64 End of Central Directory Locator signature",
                    ));
                }
            }
        }

        Ok((summary, footer.comment))
    }

    /// Size of the archive in bytes.
    pub fn size(&self) -> u64 {
        self.shared.parser.source().size()
    }

    /// Offset of the first footer record (the ZIP64 record if present).
    pub fn footer_offset(&self) -> u64 {
        self.shared.footer_offset
    }

    /// Archive comment, decoded as CP437 unless string decoding is off.
    pub fn comment(&self) -> &str {
        &self.shared.comment
    }

    pub fn raw_comment(&self) -> &[u8] {
        &self.shared.raw_comment
    }

    pub fn is_zip64(&self) -> bool {
        self.shared.is_zip64
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.shared.options
    }

    /// Current best knowledge of the entry count.
    pub fn entry_count(&self) -> u64 {
        self.shared.directory().entry_count
    }

    pub fn entry_count_is_certain(&self) -> bool {
        self.shared.directory().entry_count_certain()
    }

    pub fn central_directory_offset(&self) -> u64 {
        self.shared.directory().offset
    }

    pub fn central_directory_size(&self) -> u64 {
        self.shared.directory().size
    }

    pub fn central_directory_size_is_certain(&self) -> bool {
        self.shared.directory().directory_size_certain()
    }

    pub fn compressed_sizes_are_certain(&self) -> bool {
        self.shared.directory().compressed_sizes_certain()
    }

    pub fn uncompressed_sizes_are_certain(&self) -> bool {
        self.shared.directory().uncompressed_sizes_certain()
    }

    /// Number of entries returned so far.
    pub fn entries_read(&self) -> u64 {
        self.shared.directory().entries_read
    }

    pub fn quirk_status(&self) -> QuirkStatus {
        self.shared.directory().state.status()
    }

    /// Whether the archive is confirmed as written by macOS Archive Utility
    /// with truncated fields.
    pub fn is_mac_archive(&self) -> bool {
        self.quirk_status() == QuirkStatus::Quirked
    }

    /// Whether the archive may still turn out either way.
    pub fn is_maybe_mac_archive(&self) -> bool {
        self.quirk_status() == QuirkStatus::Suspected
    }

    pub fn is_open(&self) -> bool {
        self.shared.parser.source().is_open()
    }

    /// Close the underlying source.
    ///
    /// # Errors
    ///
    /// Fails with a usage error while any read or entry stream is in progress.
    pub async fn close(&self) -> ZipResult<()> {
        self.shared.parser.source().close().await
    }

    /// Read the next entry, or `None` once all entries have been read.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if another call is still in progress.
    pub async fn next_entry(&self) -> ZipResult<Option<ZipFileEntry>> {
        let _guard = ReadingGuard::acquire(&self.shared.reading)?;
        self.shared.read_entry().await
    }

    /// Read up to `max` further entries.
    pub async fn read_entries(&self, max: usize) -> ZipResult<Vec<ZipFileEntry>> {
        let mut entries = Vec::new();
        while entries.len() < max {
            match self.next_entry().await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Read all remaining entries.
    pub async fn entries(&self) -> ZipResult<Vec<ZipFileEntry>> {
        self.read_entries(usize::MAX).await
    }

    /// Open a stream on an entry of this archive.
    ///
    /// # Errors
    ///
    /// Fails with a usage error if `entry` came from another archive, and
    /// otherwise as [`ZipFileEntry::open_read_stream`].
    pub async fn open_read_stream(&self, entry: &ZipFileEntry, options: ReadOptions) -> ZipResult<EntryReader> {
        if !entry.belongs_to(&self.shared) {
            return Err(ZipError::usage("`entry` must be an entry from this ZIP file"));
        }
        entry.open_read_stream(options).await
    }
}

/// Bounds every classification must respect.
fn check_directory_bounds(dir: &Directory) -> ZipResult<()> {
    if dir.end() > dir.footer_offset {
        return Err(ZipError::format("Central Directory overlaps the End of Central Directory Record"));
    }
    if matches!(dir.state, QuirkState::Standard) && dir.size < dir.entry_count.saturating_mul(CDH_MIN_LENGTH) {
        return Err(ZipError::consistency("Inconsistent Central Directory size and entry count"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::structures::EndOfCentralDirectory;

    #[tokio::test]
    async fn too_small_for_footer() {
        let err = ZipArchive::from_buffer(vec![0u8; 10], ArchiveOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ZipError::Format(_)));
    }

    #[tokio::test]
    async fn empty_archive_has_no_entries() {
        let mut data = Vec::new();
        data.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        data.extend_from_slice(&[0u8; 18]);
        let archive = ZipArchive::from_buffer(data, ArchiveOptions::default()).await.unwrap();
        assert_eq!(archive.quirk_status(), QuirkStatus::Standard);
        assert!(archive.next_entry().await.unwrap().is_none());
        assert!(archive.next_entry().await.unwrap().is_none());
        archive.close().await.unwrap();
        assert!(!archive.is_open());
    }

    #[tokio::test]
    async fn multi_disk_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(EndOfCentralDirectory::SIGNATURE);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 16]);
        let err = ZipArchive::from_buffer(data, ArchiveOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Multi-disk"));
    }
}
