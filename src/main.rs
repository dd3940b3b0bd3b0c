//! Main entry point for the quirkzip CLI application.
//!
//! This binary lists and extracts ZIP archives, including the large archives
//! macOS Archive Utility writes with truncated ZIP fields.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::{Path, PathBuf};

use quirkzip::{Cli, QuirkStatus, ZipArchive, ZipExtractor, ZipFileEntry};

/// Application entry point.
///
/// Parses command-line arguments, opens the archive and dispatches to
/// listing or extraction.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let archive = ZipArchive::open_path(&cli.file, cli.archive_options())
        .await
        .with_context(|| format!("cannot open {}", cli.file))?;
    info!("opened {} ({} bytes)", cli.file, archive.size());

    let extractor = ZipExtractor::new(archive).await?;
    process_zip(&extractor, &cli).await?;
    extractor.archive().close().await?;

    Ok(())
}

/// Process a ZIP archive based on CLI options.
///
/// - List mode (`-l` or `-v`): Display archive contents
/// - Extract mode: Extract files matching the specified filters
async fn process_zip(extractor: &ZipExtractor, cli: &Cli) -> Result<()> {
    // List mode: display archive contents and exit
    if cli.list || cli.verbose {
        list_files(extractor, cli.verbose);
        return Ok(());
    }

    // Directories are created along with the files inside them
    let files_to_extract: Vec<_> = extractor
        .list_files()
        .iter()
        .filter(|e| !e.is_directory() && is_selected(cli, e.file_name()))
        .collect();

    let multiple_files = cli.pipe && files_to_extract.len() > 1;
    for entry in files_to_extract {
        extract_file(extractor, entry, cli, multiple_files).await?;
    }

    if !cli.is_very_quiet() && extractor.archive().is_mac_archive() {
        eprintln!("note: archive was written by macOS Archive Utility and recovered");
    }

    Ok(())
}

/// Whether an entry is requested by the positional filters and not excluded.
fn is_selected(cli: &Cli, name: &str) -> bool {
    if !cli.files.is_empty() {
        let matches = cli.files.iter().any(|f| {
            if has_glob_chars(f) {
                glob_match(f, name)
            } else {
                // No wildcards: exact match on filename or full path
                name == f || base_name(name) == *f
            }
        });
        if !matches {
            return false;
        }
    }

    !cli.exclude.iter().any(|x| name.contains(x.as_str()) || glob_match(x, name))
}

/// List files in the ZIP archive.
///
/// - Simple format (`-l`): Just file names, one per line
/// - Verbose format (`-v`): Detailed table with size, compression ratio,
///   timestamps and the archive's classification
fn list_files(extractor: &ZipExtractor, verbose: bool) {
    let entries = extractor.list_files();

    if verbose {
        let archive = extractor.archive();
        let status = match archive.quirk_status() {
            QuirkStatus::Standard => "standard",
            QuirkStatus::Suspected => "possibly macOS Archive Utility (unconfirmed)",
            QuirkStatus::Quirked => "macOS Archive Utility, truncated fields recovered",
        };
        println!("Archive:  {}  {}", format_size(archive.size()), status);
        if !archive.comment().is_empty() {
            println!("{}", archive.comment());
        }
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        if !verbose {
            println!("{}", entry.file_name());
            continue;
        }

        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        let uncompressed = entry.uncompressed_size();
        let compressed = entry.compressed_size();

        // A trailing '?' marks a size that may still grow by multiples of 4 GiB
        let certainty = if entry.uncompressed_size_is_certain() { ' ' } else { '?' };
        println!(
            "{:>10}{} {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            uncompressed,
            certainty,
            compressed,
            ratio(compressed, uncompressed),
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name()
        );

        if !entry.is_directory() {
            total_uncompressed += uncompressed;
            total_compressed += compressed;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
    }
}

/// Compression ratio as percentage saved.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Extract a single file from the archive.
///
/// Handles pipe mode (`-p`), the output directory (`-d`), junk paths (`-j`)
/// and overwrite control (`-n`, `-o`). With `show_filename`, a marker line
/// precedes the content in pipe mode.
async fn extract_file(extractor: &ZipExtractor, entry: &ZipFileEntry, cli: &Cli, show_filename: bool) -> Result<()> {
    if cli.pipe {
        if show_filename {
            use tokio::io::AsyncWriteExt;
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(format!("--- {} ---\n", entry.file_name()).as_bytes())
                .await?;
        }
        extractor
            .extract_to_stdout(entry)
            .await
            .with_context(|| format!("cannot extract {}", entry.file_name()))?;
        return Ok(());
    }

    let file_name = if cli.junk_paths {
        base_name(entry.file_name())
    } else {
        entry.file_name().to_string()
    };
    let output_path = match &cli.extract_dir {
        Some(dir) => PathBuf::from(dir).join(&file_name),
        None => PathBuf::from(&file_name),
    };

    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.file_name());
            }
            return Ok(());
        }

        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.file_name());
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.file_name());
    }

    extractor
        .extract_to_file(entry, &output_path)
        .await
        .with_context(|| format!("cannot extract {}", entry.file_name()))?;

    Ok(())
}

fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Check if a pattern contains glob wildcard characters.
fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Simple glob pattern matching supporting `*` and `?` wildcards.
///
/// ```ignore
/// assert!(glob_match("*.txt", "readme.txt"));
/// assert!(glob_match("file?.dat", "file1.dat"));
/// assert!(!glob_match("*.txt", "readme.md"));
/// ```
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            // Star matches zero characters, or one and stays for more
            (Some('*'), _) => do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..])),
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
