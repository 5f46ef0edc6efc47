use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::net::{ClientConfig, DEFAULT_CONCURRENCY, DEFAULT_MAX_REDIRECTS};

#[derive(Parser, Debug)]
#[command(name = "bytechain")]
#[command(version)]
#[command(about = "Stream, unzip and transform remote or local data with resumable pipelines", long_about = None)]
#[command(after_help = "Examples:\n  \
  bytechain --unzip https://example.com/export.wxr.zip       print the members of a remote archive\n  \
  bytechain --unzip --only '*.xml' -d out site.zip          extract only the XML members into out/\n  \
  bytechain -c 4 --checkpoint run.json --pause-after 100 URL...   stop after 100 chunks, resume with --resume")]
pub struct Cli {
    /// HTTP URLs, or a single local file
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<String>,

    /// Maximum simultaneous connections
    #[arg(short = 'c', long, value_name = "N", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Redirect hops followed per request
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_REDIRECTS)]
    pub max_redirects: u32,

    /// Seconds without socket activity before open requests fail
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub timeout: u64,

    /// Decode chunked transfer-encoding
    #[arg(long)]
    pub dechunk: bool,

    /// Decode deflate content-encoding
    #[arg(long)]
    pub inflate: bool,

    /// Treat every input as a ZIP archive and stream its members
    #[arg(long)]
    pub unzip: bool,

    /// Upper-case ASCII letters of the output
    #[arg(long)]
    pub upper: bool,

    /// Only keep files matching these patterns (`*` and `?` wildcards)
    #[arg(long, value_name = "GLOB", num_args = 1..)]
    pub only: Vec<String>,

    /// Write each file into DIR instead of stdout
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<PathBuf>,

    /// Stop at the first stage error
    #[arg(long)]
    pub stop_on_errors: bool,

    /// Checkpoint file written by --pause-after and read by --resume
    #[arg(long, value_name = "FILE")]
    pub checkpoint: Option<PathBuf>,

    /// Pause after this many output chunks and save the checkpoint
    #[arg(long, value_name = "N", requires = "checkpoint")]
    pub pause_after: Option<u64>,

    /// Continue from the checkpoint file
    #[arg(long, requires = "checkpoint")]
    pub resume: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// More logging (-vv => trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn is_http_url(input: &str) -> bool {
        input.starts_with("http://") || input.starts_with("https://")
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    /// Default log level before `RUST_LOG` is applied.
    pub fn log_level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (q, _) if q > 1 => LevelFilter::OFF,
            (1, _) => LevelFilter::ERROR,
            (_, 0) => LevelFilter::WARN,
            (_, 1) => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .concurrency(self.concurrency)
            .max_redirects(self.max_redirects)
            .poll_timeout(Duration::from_secs(self.timeout))
    }
}

/// True when no patterns are given or any pattern matches the full name or
/// its base name.
pub fn matches_any(patterns: &[String], name: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let basename = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    patterns.iter().any(|pattern| {
        if has_glob_chars(pattern) {
            glob_match(pattern, name) || glob_match(pattern, &basename)
        } else {
            name == pattern.as_str() || basename == pattern.as_str()
        }
    })
}

/// Check if a pattern contains glob wildcard characters.
pub fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Simple glob pattern matching supporting `*` and `?` wildcards.
///
/// - `*` matches zero or more characters
/// - `?` matches exactly one character
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            // Star matches zero characters, or one and stays for more
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
pub fn format_size(size: u64) -> String {
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
