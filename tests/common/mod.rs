//! Archive builders and readers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use quirkzip::ReadAt;

pub const GIB: u64 = 1 << 30;
pub const FOUR_GIB: u64 = 1 << 32;

const DOS_TIME: u16 = (12 << 11) | (30 << 5);
const DOS_DATE: u16 = ((2024 - 1980) << 9) | (3 << 5) | 14;

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn put16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// End of Central Directory record with the given (possibly truncated) fields.
fn eocd(count: u16, cd_size: u32, cd_offset: u32, comment: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"PK\x05\x06");
    put16(&mut out, 0);
    put16(&mut out, 0);
    put16(&mut out, count);
    put16(&mut out, count);
    put32(&mut out, cd_size);
    put32(&mut out, cd_offset);
    put16(&mut out, comment.len() as u16);
    out.extend_from_slice(comment);
    out
}

/// An entry for [`ZipBuilder`].
pub struct Entry {
    pub name: Vec<u8>,
    pub method: u16,
    pub flags: u16,
    pub data: Vec<u8>,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl Entry {
    pub fn stored(name: &str, content: &[u8]) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            method: 0,
            flags: 0,
            data: content.to_vec(),
            uncompressed_size: content.len() as u64,
            crc32: crc32fast::hash(content),
            extra: Vec::new(),
            comment: Vec::new(),
        }
    }

    pub fn deflated(name: &str, content: &[u8]) -> Self {
        Self {
            method: 8,
            data: deflate(content),
            ..Self::stored(name, content)
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_extra(mut self, id: u16, data: &[u8]) -> Self {
        put16(&mut self.extra, id);
        put16(&mut self.extra, data.len() as u16);
        self.extra.extend_from_slice(data);
        self
    }

    pub fn with_raw_name(mut self, name: &[u8]) -> Self {
        self.name = name.to_vec();
        self
    }

    pub fn with_comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }
}

/// Builds ordinary archives as a conforming writer would.
#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<Entry>,
    comment: Vec<u8>,
    zip64: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Write ZIP64 records, with every entry's sizes and offset in the
    /// extended information field.
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::new();

        for entry in &self.entries {
            offsets.push(out.len() as u64);
            out.extend_from_slice(b"PK\x03\x04");
            put16(&mut out, 20);
            put16(&mut out, entry.flags);
            put16(&mut out, entry.method);
            put16(&mut out, DOS_TIME);
            put16(&mut out, DOS_DATE);
            put32(&mut out, entry.crc32);
            put32(&mut out, entry.data.len() as u32);
            put32(&mut out, entry.uncompressed_size as u32);
            put16(&mut out, entry.name.len() as u16);
            put16(&mut out, 0);
            out.extend_from_slice(&entry.name);
            out.extend_from_slice(&entry.data);
        }

        let cd_offset = out.len() as u64;
        for (entry, &lfh_offset) in self.entries.iter().zip(&offsets) {
            let mut extra = entry.extra.clone();
            let (csize, uncompressed, offset) = if self.zip64 {
                put16(&mut extra, 0x0001);
                put16(&mut extra, 24);
                put64(&mut extra, entry.uncompressed_size);
                put64(&mut extra, entry.data.len() as u64);
                put64(&mut extra, lfh_offset);
                (u32::MAX, u32::MAX, u32::MAX)
            } else {
                (entry.data.len() as u32, entry.uncompressed_size as u32, lfh_offset as u32)
            };

            out.extend_from_slice(b"PK\x01\x02");
            put16(&mut out, 20);
            put16(&mut out, 20);
            put16(&mut out, entry.flags);
            put16(&mut out, entry.method);
            put16(&mut out, DOS_TIME);
            put16(&mut out, DOS_DATE);
            put32(&mut out, entry.crc32);
            put32(&mut out, csize);
            put32(&mut out, uncompressed);
            put16(&mut out, entry.name.len() as u16);
            put16(&mut out, extra.len() as u16);
            put16(&mut out, entry.comment.len() as u16);
            put16(&mut out, 0);
            put16(&mut out, 0);
            put32(&mut out, 0);
            put32(&mut out, offset);
            out.extend_from_slice(&entry.name);
            out.extend_from_slice(&extra);
            out.extend_from_slice(&entry.comment);
        }
        let cd_size = out.len() as u64 - cd_offset;

        if self.zip64 {
            let eocd64_offset = out.len() as u64;
            out.extend_from_slice(b"PK\x06\x06");
            put64(&mut out, 44);
            put16(&mut out, 45);
            put16(&mut out, 45);
            put32(&mut out, 0);
            put32(&mut out, 0);
            put64(&mut out, self.entries.len() as u64);
            put64(&mut out, self.entries.len() as u64);
            put64(&mut out, cd_size);
            put64(&mut out, cd_offset);

            out.extend_from_slice(b"PK\x06\x07");
            put32(&mut out, 0);
            put64(&mut out, eocd64_offset);
            put32(&mut out, 1);
            out.extend_from_slice(&eocd(0xFFFF, u32::MAX, u32::MAX, &self.comment));
        } else {
            out.extend_from_slice(&eocd(
                self.entries.len() as u16,
                cd_size as u32,
                cd_offset as u32,
                &self.comment,
            ));
        }
        out
    }
}

/// Content of an entry written by [`MacZipBuilder`].
enum MacContent {
    /// Deflated file. `data` of `None` leaves the compressed bytes zeroed.
    File {
        data: Option<Vec<u8>>,
        compressed_size: u64,
        uncompressed_size: u64,
        crc32: u32,
    },
    Folder,
    Symlink(Vec<u8>),
}

pub struct MacEntry {
    name: Vec<u8>,
    content: MacContent,
}

impl MacEntry {
    pub fn file(name: &str, content: &[u8]) -> Self {
        let data = deflate(content);
        Self {
            name: name.as_bytes().to_vec(),
            content: MacContent::File {
                compressed_size: data.len() as u64,
                uncompressed_size: content.len() as u64,
                crc32: crc32fast::hash(content),
                data: Some(data),
            },
        }
    }

    /// A file whose data is never written, only its sizes.
    pub fn sparse_file(name: &str, compressed_size: u64, uncompressed_size: u64) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            content: MacContent::File {
                data: None,
                compressed_size,
                uncompressed_size,
                crc32: 0x1234_5678,
            },
        }
    }

    pub fn folder(name: &str) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            content: MacContent::Folder,
        }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            content: MacContent::Symlink(target.as_bytes().to_vec()),
        }
    }
}

/// Builds archives the way macOS Archive Utility does: no ZIP64 records, and
/// every size, offset and count silently truncated to its field width.
#[derive(Default)]
pub struct MacZipBuilder {
    entries: Vec<MacEntry>,
    sizes_in_local_headers: bool,
}

impl MacZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: MacEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Write CRC and sizes into the local headers, as the producer never does.
    pub fn sizes_in_local_headers(mut self) -> Self {
        self.sizes_in_local_headers = true;
        self
    }

    pub fn build(&self) -> SparseImage {
        let mut image = SparseImage::default();
        let mut central = Vec::new();

        for entry in &self.entries {
            let lfh_offset = image.size;
            let (version, flags, method, crc32, csize, uncompressed) = match &entry.content {
                MacContent::File {
                    compressed_size,
                    uncompressed_size,
                    crc32,
                    ..
                } => (20, 8, 8, *crc32, *compressed_size, *uncompressed_size),
                MacContent::Folder => (10, 0, 0, 0, 0, 0),
                MacContent::Symlink(target) => (10, 0, 0, crc32fast::hash(target), target.len() as u64, target.len() as u64),
            };
            let has_extra = !matches!(entry.content, MacContent::Symlink(_));

            let mut lfh = Vec::new();
            lfh.extend_from_slice(b"PK\x03\x04");
            put16(&mut lfh, version);
            put16(&mut lfh, flags);
            put16(&mut lfh, method);
            put16(&mut lfh, DOS_TIME);
            put16(&mut lfh, DOS_DATE);
            if self.sizes_in_local_headers {
                put32(&mut lfh, crc32);
                put32(&mut lfh, csize as u32);
                put32(&mut lfh, uncompressed as u32);
            } else {
                lfh.extend_from_slice(&[0; 12]);
            }
            put16(&mut lfh, entry.name.len() as u16);
            put16(&mut lfh, if has_extra { 16 } else { 0 });
            lfh.extend_from_slice(&entry.name);
            if has_extra {
                put16(&mut lfh, 0x5855);
                put16(&mut lfh, 12);
                lfh.extend_from_slice(&[0; 12]);
            }
            image.append(&lfh);

            match &entry.content {
                MacContent::File { data, .. } => {
                    match data {
                        Some(data) => image.append(data),
                        None => image.skip(csize),
                    }
                    let mut descriptor = Vec::new();
                    descriptor.extend_from_slice(b"PK\x07\x08");
                    put32(&mut descriptor, crc32);
                    put32(&mut descriptor, csize as u32);
                    put32(&mut descriptor, uncompressed as u32);
                    image.append(&descriptor);
                }
                MacContent::Folder => {}
                MacContent::Symlink(target) => image.append(target),
            }

            central.extend_from_slice(b"PK\x01\x02");
            put16(&mut central, 789);
            put16(&mut central, version);
            put16(&mut central, flags);
            put16(&mut central, method);
            put16(&mut central, DOS_TIME);
            put16(&mut central, DOS_DATE);
            put32(&mut central, crc32);
            put32(&mut central, csize as u32);
            put32(&mut central, uncompressed as u32);
            put16(&mut central, entry.name.len() as u16);
            put16(&mut central, if has_extra { 12 } else { 0 });
            put16(&mut central, 0);
            put16(&mut central, 0);
            put16(&mut central, 0);
            put32(&mut central, 0o100644 << 16);
            put32(&mut central, lfh_offset as u32);
            central.extend_from_slice(&entry.name);
            if has_extra {
                put16(&mut central, 0x5855);
                put16(&mut central, 8);
                central.extend_from_slice(&[0; 8]);
            }
        }

        let cd_offset = image.size;
        image.append(&central);
        image.append(&eocd(
            self.entries.len() as u16,
            central.len() as u32,
            cd_offset as u32,
            b"",
        ));
        image
    }
}

/// A virtual archive image where unwritten ranges read as zeros.
///
/// Lets tests present archives larger than 4 GiB without allocating them.
#[derive(Default, Clone)]
pub struct SparseImage {
    chunks: BTreeMap<u64, Vec<u8>>,
    size: u64,
}

impl SparseImage {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let offset = self.size;
        match self.chunks.iter_mut().next_back() {
            Some((start, chunk)) if *start + chunk.len() as u64 == offset => chunk.extend_from_slice(bytes),
            _ => {
                self.chunks.insert(offset, bytes.to_vec());
            }
        }
        self.size += bytes.len() as u64;
    }

    pub fn skip(&mut self, len: u64) {
        self.size += len;
    }

    /// Materialise a small image.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.size as usize];
        for (&start, chunk) in &self.chunks {
            out[start as usize..start as usize + chunk.len()].copy_from_slice(chunk);
        }
        out
    }

    /// Overwrite bytes already appended.
    pub fn patch(&mut self, offset: u64, bytes: &[u8]) {
        let (&start, chunk) = self
            .chunks
            .range_mut(..=offset)
            .next_back()
            .expect("patch outside written data");
        let at = (offset - start) as usize;
        chunk[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

#[async_trait]
impl ReadAt for SparseImage {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.size - offset) as usize;
        let end = offset + len as u64;
        let buf = &mut buf[..len];
        buf.fill(0);

        for (&start, chunk) in self.chunks.range(..end).rev() {
            let chunk_end = start + chunk.len() as u64;
            if chunk_end <= offset {
                break;
            }
            let from = start.max(offset);
            let to = chunk_end.min(end);
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&chunk[(from - start) as usize..(to - start) as usize]);
        }
        Ok(len)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Counts the bytes read through it.
pub struct CountingReader<R> {
    inner: R,
    bytes_read: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> (Self, Arc<AtomicU64>) {
        let bytes_read = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                bytes_read: bytes_read.clone(),
            },
            bytes_read,
        )
    }
}

#[async_trait]
impl<R: ReadAt> ReadAt for CountingReader<R> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_at(offset, buf).await?;
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Yields to the scheduler once before every read, so concurrent operations
/// interleave deterministically under `tokio::join!`.
pub struct YieldingReader<R>(pub R);

#[async_trait]
impl<R: ReadAt> ReadAt for YieldingReader<R> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        tokio::task::yield_now().await;
        self.0.read_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        self.0.size()
    }
}

/// In-memory archive whose bytes can be rewritten while it is open.
pub struct MutableBuffer(Mutex<Vec<u8>>);

impl MutableBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self(Mutex::new(data))
    }

    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        self.0.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[async_trait]
impl ReadAt for MutableBuffer {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.0.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.0.lock().unwrap().len() as u64
    }
}
