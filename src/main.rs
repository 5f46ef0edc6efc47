//! Main entry point for the bytechain CLI application.
//!
//! Builds a chain from the command-line flags (source, optional decoders,
//! unzip, filter, transform) and drives it until it finishes, pauses or
//! fails.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bytechain::cli::{format_size, matches_any};
use bytechain::{
    ArchiveReader, CheckpointError, ChunkedDecoder, Cli, Demultiplexer, FileFilter, HttpSource,
    InflateStage, LocalFileSource, OutputChunk, PipelineChain, PipelineCheckpoint, SourceStage,
    Tick, Transform,
};

/// Longest back-off between idle ticks.
const MAX_BACKOFF: Duration = Duration::from_millis(200);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let (mut chain, names) = build_chain(&cli)?;
    if cli.resume {
        let path = checkpoint_path(&cli)?;
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        chain.resume(PipelineCheckpoint::from_json(&json)?)?;
        tracing::info!(path = %path.display(), "resumed from checkpoint");
    }

    let mut sink = Sink::new(cli.extract_dir.clone(), names, cli.resume)?;
    let mut chunks = 0u64;
    let mut failures = 0usize;
    let mut idle_ticks = 0u32;

    loop {
        match chain.tick()? {
            Tick::Output(chunk) => {
                idle_ticks = 0;
                sink.write(&chunk)?;
                chunks += 1;
                if cli.pause_after.is_some_and(|n| chunks >= n) {
                    let checkpoint = match chain.pause() {
                        Ok(checkpoint) => checkpoint,
                        Err(err @ CheckpointError::ReplayTooLarge { .. }) => {
                            // Retry on the next chunk; the member ends eventually.
                            tracing::debug!(%err, "cannot pause yet");
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    let path = checkpoint_path(&cli)?;
                    fs::write(path, checkpoint.to_json()?)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    if !cli.is_quiet() {
                        eprintln!("Paused after {chunks} chunks; checkpoint saved to {}", path.display());
                    }
                    return Ok(());
                }
            }
            Tick::Failed(failure) => {
                failures += 1;
                if !cli.is_quiet() {
                    eprintln!("error: {failure}");
                }
            }
            Tick::Pending if chain.is_idle() => {
                // Nothing buffered anywhere: back off instead of spinning.
                std::thread::sleep(backoff(idle_ticks));
                idle_ticks = idle_ticks.saturating_add(1);
            }
            Tick::Pending => {}
            Tick::Finished => break,
        }
    }
    sink.flush()?;

    if !cli.is_quiet() {
        eprintln!("\nTotal bytes written: {}", format_size(sink.total));
    }
    if failures > 0 {
        bail!("{failures} stage failure(s)");
    }
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(cli.log_level().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn checkpoint_path(cli: &Cli) -> Result<&Path> {
    cli.checkpoint
        .as_deref()
        .context("a checkpoint file is required (--checkpoint)")
}

fn backoff(idle_ticks: u32) -> Duration {
    Duration::from_millis(1u64 << idle_ticks.min(8)).min(MAX_BACKOFF)
}

/// Assembles the chain. Also returns display names for the source's file
/// ids, used when writing un-archived downloads to disk.
fn build_chain(cli: &Cli) -> Result<(PipelineChain, HashMap<String, String>)> {
    let mut builder = PipelineChain::builder().stop_on_errors(cli.stop_on_errors);
    let mut names = HashMap::new();

    if cli.inputs.iter().all(|input| Cli::is_http_url(input)) {
        for (id, url) in (1u64..).zip(&cli.inputs) {
            names.insert(id.to_string(), url_file_name(url, id));
        }
        let source = HttpSource::from_urls(cli.client_config(), cli.inputs.clone())?;
        builder = builder.stage("source", source);
    } else if let [path] = cli.inputs.as_slice() {
        builder = builder.stage("source", SourceStage::new(LocalFileSource::new(Path::new(path))));
    } else {
        bail!("pass either HTTP URLs or a single local file");
    }

    if cli.dechunk {
        builder = builder.stage("dechunk", Demultiplexer::new(ChunkedDecoder::new));
    }
    if cli.inflate {
        builder = builder.stage("inflate", Demultiplexer::new(InflateStage::new));
    }
    let mut upstream = "source";
    if cli.unzip {
        builder = builder.stage("unzip", Demultiplexer::new(ArchiveReader::new));
        upstream = "unzip";
    }
    if !cli.only.is_empty() {
        let patterns = cli.only.clone();
        builder = builder.stage(
            "only",
            FileFilter::new(upstream, move |name| matches_any(&patterns, name)),
        );
    }
    if cli.upper {
        builder = builder.stage("upper", Transform::uppercase());
    }
    Ok((builder.build()?, names))
}

/// Last path segment of a URL, or `download-<id>`.
fn url_file_name(url: &str, id: u64) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .filter(|segment| !segment.is_empty())
                .last()
                .map(String::from)
        })
        .unwrap_or_else(|| format!("download-{id}"))
}

/// Where output chunks go: stdout, or one file per file id under a
/// directory.
struct Sink {
    dir: Option<PathBuf>,
    names: HashMap<String, String>,
    /// Existing files are appended to instead of truncated.
    append: bool,
    files: HashMap<String, File>,
    total: u64,
}

impl Sink {
    fn new(dir: Option<PathBuf>, names: HashMap<String, String>, append: bool) -> Result<Self> {
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self {
            dir,
            names,
            append,
            files: HashMap::new(),
            total: 0,
        })
    }

    fn write(&mut self, chunk: &OutputChunk) -> Result<()> {
        self.total += chunk.data.len() as u64;
        let Some(dir) = &self.dir else {
            std::io::stdout().write_all(&chunk.data)?;
            return Ok(());
        };

        if !self.files.contains_key(&chunk.file_id) {
            let name = self
                .names
                .get(&chunk.file_id)
                .cloned()
                .unwrap_or_else(|| chunk.file_id.clone());
            let path = dir.join(sanitize(&name)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %path.display(), "writing");
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(self.append)
                .truncate(!self.append)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            self.files.insert(chunk.file_id.clone(), file);
        }
        if let Some(file) = self.files.get_mut(&chunk.file_id) {
            file.write_all(&chunk.data)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        std::io::stdout().flush()?;
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Keeps only the plain components of an archive path so output cannot
/// escape the target directory.
fn sanitize(name: &str) -> Result<PathBuf> {
    let path: PathBuf = Path::new(name)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if path.as_os_str().is_empty() {
        bail!("refusing to write unnamed file {name:?}");
    }
    Ok(path)
}
