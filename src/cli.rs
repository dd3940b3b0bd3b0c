use clap::Parser;

use crate::zip::ArchiveOptions;

#[derive(Parser, Debug)]
#[command(name = "quirkzip")]
#[command(version)]
#[command(
    about = "An unzip utility that recovers macOS Archive Utility ZIPs over 4 GiB",
    long_about = None
)]
#[command(after_help = "Examples:\n  \
  quirkzip data1.zip -x joe        extract all files except joe from data1.zip\n  \
  quirkzip -p foo.zip | more       send contents of foo.zip via pipe into more\n  \
  quirkzip -v backup.zip           list files and show whether the archive was recovered")]
pub struct Cli {
    /// ZIP file path
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Files to extract (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely, including archive classification
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Read the archive strictly as written, without truncated-field recovery
    #[arg(long)]
    pub no_mac_support: bool,

    /// Reject filenames containing backslashes
    #[arg(long)]
    pub strict_filenames: bool,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Archive options selected by the flags.
    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            support_mac_archive: !self.no_mac_support,
            strict_filenames: self.strict_filenames,
            ..ArchiveOptions::default()
        }
    }
}
