mod common;

use std::io::Write;
use std::sync::Arc;

use common::{Entry, MutableBuffer, YieldingReader, ZipBuilder};
use quirkzip::{
    ArchiveOptions, BufferReader, CompressionMethod, QuirkStatus, ReadOptions, ZipArchive, ZipError,
};
use rstest::rstest;

const TEXT: &[u8] = b"The quick brown fox jumps over the lazy dog. The quick brown fox jumps again.";

async fn open(data: Vec<u8>) -> ZipArchive {
    ZipArchive::from_buffer(data, ArchiveOptions::default()).await.unwrap()
}

fn mixed_archive() -> Vec<u8> {
    ZipBuilder::new()
        .entry(Entry::stored("readme.txt", b"hello world"))
        .entry(Entry::deflated("docs/fox.txt", TEXT))
        .entry(Entry::stored("docs/", b""))
        .build()
}

#[tokio::test]
async fn reads_stored_and_deflated_entries() {
    let archive = open(mixed_archive()).await;
    assert_eq!(archive.quirk_status(), QuirkStatus::Standard);
    assert_eq!(archive.entry_count(), 3);
    assert!(archive.entry_count_is_certain());
    assert!(archive.uncompressed_sizes_are_certain());

    let entries = archive.entries().await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.file_name()).collect();
    assert_eq!(names, ["readme.txt", "docs/fox.txt", "docs/"]);
    assert_eq!(archive.entries_read(), 3);

    let stored = &entries[0];
    assert_eq!(stored.compression_method(), CompressionMethod::Stored);
    assert!(!stored.is_compressed());
    let data = stored.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, b"hello world");

    let deflated = &entries[1];
    assert_eq!(deflated.compression_method(), CompressionMethod::Deflate);
    assert!(deflated.is_compressed());
    assert!(deflated.uncompressed_size_is_certain());
    assert_eq!(deflated.uncompressed_size(), TEXT.len() as u64);
    let data = archive
        .open_read_stream(deflated, ReadOptions::default())
        .await
        .unwrap()
        .read_to_vec()
        .await
        .unwrap();
    assert_eq!(data, TEXT);
    assert_eq!(deflated.data_offset(), Some(deflated.lfh_offset() + 30 + 12));

    assert!(entries[2].is_directory());
    assert_eq!(deflated.mod_date(), (2024, 3, 14));
    assert_eq!(deflated.mod_time(), (12, 30, 0));

    assert!(archive.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn raw_compressed_data_can_be_streamed() {
    let archive = open(mixed_archive()).await;
    let entries = archive.read_entries(2).await.unwrap();
    assert_eq!(entries.len(), 2);

    let options = ReadOptions {
        decompress: Some(false),
        ..Default::default()
    };
    let raw = entries[1].open_read_stream(options).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(raw, common::deflate(TEXT));
}

#[tokio::test]
async fn ranged_reads_of_stored_data() {
    let archive = open(mixed_archive()).await;
    let entry = archive.next_entry().await.unwrap().unwrap();

    let options = ReadOptions {
        validate_crc32: Some(false),
        start: Some(6),
        end: Some(11),
        ..Default::default()
    };
    let data = entry.open_read_stream(options).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, b"world");

    // CRC validation is on by default for stored data and needs the whole file
    let options = ReadOptions {
        start: Some(6),
        ..Default::default()
    };
    let err = entry.open_read_stream(options).await.unwrap_err();
    assert!(matches!(err, ZipError::Usage(_)));
}

#[rstest]
#[case::start_after_end(Some(12), None)]
#[case::end_after_end(None, Some(12))]
#[case::end_before_start(Some(5), Some(4))]
#[tokio::test]
async fn invalid_ranges_are_usage_errors(#[case] start: Option<u64>, #[case] end: Option<u64>) {
    let archive = open(mixed_archive()).await;
    let entry = archive.next_entry().await.unwrap().unwrap();
    let options = ReadOptions {
        validate_crc32: Some(false),
        start,
        end,
        ..Default::default()
    };
    assert!(matches!(entry.open_read_stream(options).await.unwrap_err(), ZipError::Usage(_)));
}

#[tokio::test]
async fn contradictory_options_fail_before_io() {
    let archive = open(mixed_archive()).await;
    let entries = archive.read_entries(2).await.unwrap();

    let options = ReadOptions {
        decompress: Some(false),
        validate_crc32: Some(true),
        ..Default::default()
    };
    assert!(matches!(entries[1].open_read_stream(options).await.unwrap_err(), ZipError::Usage(_)));

    let options = ReadOptions {
        start: Some(1),
        validate_crc32: Some(false),
        ..Default::default()
    };
    assert!(matches!(entries[1].open_read_stream(options).await.unwrap_err(), ZipError::Usage(_)));
}

#[tokio::test]
async fn corrupted_data_fails_crc_check() {
    let mut data = mixed_archive();
    // First byte of "hello world"
    data[30 + "readme.txt".len()] ^= 0xFF;

    let archive = open(data).await;
    let entry = archive.next_entry().await.unwrap().unwrap();
    let err = entry.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap_err();
    assert!(matches!(err, ZipError::Crc32Mismatch { .. }));
}

#[rstest]
#[case::too_small(TEXT.len() as u64 - 1, true)]
#[case::too_large(TEXT.len() as u64 + 1, false)]
#[tokio::test]
async fn wrong_uncompressed_size_is_detected(#[case] stated: u64, #[case] overrun: bool) {
    let mut entry = Entry::deflated("fox.txt", TEXT);
    entry.uncompressed_size = stated;
    let archive = open(ZipBuilder::new().entry(entry).build()).await;

    let entry = archive.next_entry().await.unwrap().unwrap();
    let err = entry.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap_err();
    if overrun {
        assert!(matches!(err, ZipError::TooManyBytes { expected, .. } if expected == stated));
    } else {
        assert!(matches!(err, ZipError::TooFewBytes { expected, actual } if expected == stated && actual == TEXT.len() as u64));
    }
}

#[tokio::test]
async fn size_validation_can_be_disabled() {
    let mut entry = Entry::deflated("fox.txt", TEXT);
    entry.uncompressed_size = 3;
    let options = ArchiveOptions {
        validate_entry_sizes: false,
        ..Default::default()
    };
    let archive = ZipArchive::from_buffer(ZipBuilder::new().entry(entry).build(), options).await.unwrap();

    let entry = archive.next_entry().await.unwrap().unwrap();
    let data = entry.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, TEXT);
}

#[tokio::test]
async fn stored_entry_size_mismatch_is_rejected() {
    let mut entry = Entry::stored("a.bin", b"abcdef");
    entry.uncompressed_size = 5;
    let archive = open(ZipBuilder::new().entry(entry).build()).await;
    assert!(matches!(archive.next_entry().await.unwrap_err(), ZipError::Format(_)));
}

#[tokio::test]
async fn encrypted_entries_cannot_be_decrypted() {
    let mut entry = Entry::stored("secret.bin", &[7; 20]).with_flags(0x0001);
    entry.uncompressed_size = 8;
    let archive = open(ZipBuilder::new().entry(entry).build()).await;
    let entry = archive.next_entry().await.unwrap().unwrap();
    assert!(entry.is_encrypted());

    let err = entry.open_read_stream(ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, ZipError::Unsupported(_)));

    let options = ReadOptions {
        decrypt: Some(false),
        ..Default::default()
    };
    assert!(matches!(entry.open_read_stream(options).await.unwrap_err(), ZipError::Usage(_)));

    let options = ReadOptions {
        decrypt: Some(false),
        validate_crc32: Some(false),
        ..Default::default()
    };
    let raw = entry.open_read_stream(options).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(raw, [7; 20]);
}

#[tokio::test]
async fn unknown_compression_method_is_unsupported() {
    let mut entry = Entry::stored("a.bz2", b"BZh9");
    entry.method = 12;
    let archive = open(ZipBuilder::new().entry(entry).build()).await;
    let entry = archive.next_entry().await.unwrap().unwrap();
    assert_eq!(entry.compression_method(), CompressionMethod::Unknown(12));
    assert!(matches!(
        entry.open_read_stream(ReadOptions::default()).await.unwrap_err(),
        ZipError::Unsupported(_)
    ));
}

#[tokio::test]
async fn zip64_archive() {
    let data = ZipBuilder::new()
        .entry(Entry::stored("a.txt", b"first"))
        .entry(Entry::deflated("b.txt", TEXT))
        .zip64()
        .build();
    let eocd64_offset = data.len() as u64 - 22 - 20 - 56;
    let archive = open(data).await;

    assert!(archive.is_zip64());
    assert_eq!(archive.footer_offset(), eocd64_offset);
    assert_eq!(archive.entry_count(), 2);

    let entries = archive.entries().await.unwrap();
    assert!(entries.iter().all(|e| e.is_zip64()));
    assert_eq!(entries[1].uncompressed_size(), TEXT.len() as u64);
    let data = entries[1].open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, TEXT);
}

#[tokio::test]
async fn missing_zip64_locator_is_an_error_without_mac_support() {
    let mut data = ZipBuilder::new().entry(Entry::stored("a.txt", b"x")).build();
    let eocd = data.len() - 22;
    data[eocd + 8..eocd + 10].copy_from_slice(&0xFFFFu16.to_le_bytes());
    data[eocd + 10..eocd + 12].copy_from_slice(&0xFFFFu16.to_le_bytes());

    let options = ArchiveOptions {
        support_mac_archive: false,
        ..Default::default()
    };
    let err = ZipArchive::from_buffer(data, options).await.err().unwrap();
    assert!(matches!(err, ZipError::Format(ref msg) if msg.contains("Locator")));
}

#[tokio::test]
async fn directory_past_footer_is_rejected() {
    let mut data = mixed_archive();
    let eocd = data.len() - 22;
    let bogus = (eocd as u32).to_le_bytes();
    data[eocd + 16..eocd + 20].copy_from_slice(&bogus);
    let err = ZipArchive::from_buffer(data, ArchiveOptions::default()).await.err().unwrap();
    assert!(matches!(err, ZipError::Format(_)));
}

#[rstest]
#[case::offset(48, u64::MAX - 10)]
#[case::size(40, u64::MAX)]
#[tokio::test]
async fn zip64_directory_end_overflow_is_rejected(#[case] field: usize, #[case] value: u64) {
    let mut data = ZipBuilder::new().entry(Entry::stored("a.txt", b"x")).zip64().build();
    let eocd64 = data.len() - 22 - 20 - 56;
    data[eocd64 + field..eocd64 + field + 8].copy_from_slice(&value.to_le_bytes());
    let err = ZipArchive::from_buffer(data, ArchiveOptions::default()).await.err().unwrap();
    assert!(matches!(err, ZipError::Format(_)));
}

#[tokio::test]
async fn footer_found_behind_longest_comment_with_false_signatures() {
    let mut comment = vec![b'A'; 65535];
    // No false record's comment length reaches exactly to the end of the
    // archive, and the last one is cut off
    for pos in [0, 1000, 30_000, 65_513, 65_531] {
        comment[pos..pos + 4].copy_from_slice(b"PK\x05\x06");
    }
    let data = ZipBuilder::new()
        .entry(Entry::stored("a.txt", b"x"))
        .entry(Entry::deflated("b.txt", TEXT))
        .comment(&comment)
        .build();
    let footer = data.len() as u64 - 22 - 65535;
    let archive = open(data).await;

    assert_eq!(archive.footer_offset(), footer);
    assert_eq!(archive.entry_count(), 2);
    assert_eq!(archive.raw_comment(), &comment[..]);
    let expected = String::from_utf8(comment).unwrap().replace("PK\u{5}\u{6}", "PK\u{2663}\u{2660}");
    assert_eq!(archive.comment(), expected);
    assert_eq!(archive.entries().await.unwrap().len(), 2);
}

#[tokio::test]
async fn names_and_comments_are_decoded() {
    let unicode_name = "\u{65b0}.txt";
    let mut unicode_field = vec![1];
    unicode_field.extend_from_slice(&crc32fast::hash(b"x.txt").to_le_bytes());
    unicode_field.extend_from_slice(unicode_name.as_bytes());

    let data = ZipBuilder::new()
        .entry(Entry::stored("", b"1").with_raw_name(b"caf\x82.txt").with_comment(b"\x9c5"))
        .entry(Entry::stored("\u{fc}ber.txt", b"2").with_flags(0x0800))
        .entry(Entry::stored("x.txt", b"3").with_extra(0x7075, &unicode_field))
        .entry(Entry::stored("y.txt", b"4").with_extra(0x7075, &unicode_field))
        .comment(b"archive \x82")
        .build();
    let archive = open(data).await;
    assert_eq!(archive.comment(), "archive \u{e9}");
    assert_eq!(archive.raw_comment(), b"archive \x82");

    let entries = archive.entries().await.unwrap();
    assert_eq!(entries[0].file_name(), "caf\u{e9}.txt");
    assert_eq!(entries[0].raw_file_name(), b"caf\x82.txt");
    assert_eq!(entries[0].comment(), "\u{a3}5");
    assert_eq!(entries[1].file_name(), "\u{fc}ber.txt");
    assert_eq!(entries[2].file_name(), unicode_name);
    // CRC of the field does not match this entry's raw name
    assert_eq!(entries[3].file_name(), "y.txt");
}

#[rstest]
#[case::parent("../evil.txt")]
#[case::nested_parent("a/../../evil.txt")]
#[case::absolute("/etc/passwd")]
#[case::drive("C:/evil.txt")]
#[case::backslash_parent("..\\evil.txt")]
#[tokio::test]
async fn unsafe_filenames_are_rejected(#[case] name: &str) {
    let data = ZipBuilder::new().entry(Entry::stored(name, b"x")).build();
    let archive = open(data.clone()).await;
    assert!(matches!(archive.next_entry().await.unwrap_err(), ZipError::Format(_)));

    let options = ArchiveOptions {
        validate_filenames: false,
        ..Default::default()
    };
    let archive = ZipArchive::from_buffer(data, options).await.unwrap();
    assert_eq!(archive.next_entry().await.unwrap().unwrap().file_name(), name);
}

#[tokio::test]
async fn backslashes_are_separators_unless_strict() {
    let data = ZipBuilder::new().entry(Entry::stored("dir\\file.txt", b"x")).build();
    let archive = open(data.clone()).await;
    assert_eq!(archive.next_entry().await.unwrap().unwrap().file_name(), "dir/file.txt");

    let options = ArchiveOptions {
        strict_filenames: true,
        ..Default::default()
    };
    let archive = ZipArchive::from_buffer(data, options).await.unwrap();
    assert!(matches!(archive.next_entry().await.unwrap_err(), ZipError::Format(_)));
}

#[tokio::test]
async fn concurrent_next_entry_is_a_usage_error() {
    let reader = YieldingReader(BufferReader::new(mixed_archive()));
    let archive = ZipArchive::open(Arc::new(reader), ArchiveOptions::default()).await.unwrap();

    // The first entry is already parsed while opening, so read past it
    archive.next_entry().await.unwrap().unwrap();
    let (first, second) = tokio::join!(archive.next_entry(), archive.next_entry());
    assert_eq!(first.unwrap().unwrap().file_name(), "docs/fox.txt");
    assert!(matches!(second.unwrap_err(), ZipError::Usage(_)));

    assert_eq!(archive.next_entry().await.unwrap().unwrap().file_name(), "docs/");
}

#[tokio::test]
async fn close_waits_for_streams() {
    let archive = open(mixed_archive()).await;
    let entry = archive.next_entry().await.unwrap().unwrap();

    let stream = entry.open_read_stream(ReadOptions::default()).await.unwrap();
    assert!(matches!(archive.close().await.unwrap_err(), ZipError::Usage(_)));
    assert!(archive.is_open());

    drop(stream);
    archive.close().await.unwrap();
    assert!(!archive.is_open());
    assert!(matches!(
        entry.open_read_stream(ReadOptions::default()).await.unwrap_err(),
        ZipError::Usage(_)
    ));
}

#[tokio::test]
async fn entries_belong_to_their_archive() {
    let first = open(mixed_archive()).await;
    let second = open(mixed_archive()).await;
    let entry = first.next_entry().await.unwrap().unwrap();

    let err = second.open_read_stream(&entry, ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, ZipError::Usage(_)));

    drop(first);
    let err = entry.open_read_stream(ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, ZipError::Usage(_)));
}

#[tokio::test]
async fn reads_archives_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&mixed_archive()).unwrap();
    file.flush().unwrap();

    let archive = ZipArchive::open_path(file.path(), ArchiveOptions::default()).await.unwrap();
    assert_eq!(archive.size(), mixed_archive().len() as u64);
    assert_eq!(archive.entries().await.unwrap().len(), 3);
    archive.close().await.unwrap();

    let archive = ZipArchive::from_file(file.reopen().unwrap(), ArchiveOptions::default()).await.unwrap();
    let entry = archive.next_entry().await.unwrap().unwrap();
    let data = entry.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, b"hello world");
}

#[tokio::test]
async fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ZipArchive::open_path(dir.path().join("absent.zip"), ArchiveOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ZipError::Io(_)));
}

#[tokio::test]
async fn moved_local_header_data_is_inconsistent() {
    let buffer = Arc::new(MutableBuffer::new(
        ZipBuilder::new().entry(Entry::stored("a.txt", b"hello")).build(),
    ));
    let archive = ZipArchive::open(buffer.clone(), ArchiveOptions::default()).await.unwrap();
    let entry = archive.next_entry().await.unwrap().unwrap();
    let data = entry.open_read_stream(ReadOptions::default()).await.unwrap().read_to_vec().await.unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(entry.data_offset(), Some(30 + 5));

    // A longer extra field would move the data four bytes on
    buffer.patch(28, &4u16.to_le_bytes());
    let err = entry.open_read_stream(ReadOptions::default()).await.unwrap_err();
    assert!(matches!(err, ZipError::Consistency(_)));
    assert_eq!(entry.data_offset(), Some(30 + 5));
}
