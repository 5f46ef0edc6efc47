use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Source;
use crate::checkpoint::{self, StageState};
use crate::error::CheckpointError;
use crate::stream::{ByteStream, PipelineContext, StreamState};

const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Local file source reading with positioned reads.
pub struct LocalFileSource {
    path: PathBuf,
    id: String,
    file: Option<File>,
    offset: u64,
    read_size: usize,
}

impl LocalFileSource {
    pub fn new(path: &Path) -> Self {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path: path.to_path_buf(),
            id,
            file: None,
            offset: 0,
            read_size: DEFAULT_READ_SIZE,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.read_at(buf, offset)
        }

        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = file;
            file.seek(SeekFrom::Start(offset))?;
            file.read(buf)
        }
    }
}

impl Source for LocalFileSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        self.file = Some(file);
        self.offset = offset;
        Ok(())
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(file) = &self.file else {
            anyhow::bail!("{} is not open", self.path.display());
        };
        let mut buf = vec![0u8; self.read_size];
        let n = Self::read_at(file, self.offset, &mut buf)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        self.offset += n as u64;
        Ok(Some(Bytes::from(buf)))
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Adapts any [`Source`] into the first stage of a chain.
///
/// The checkpoint is the number of bytes delivered; resuming reopens the
/// source at that offset.
pub struct SourceStage<S> {
    state: StreamState,
    source: S,
    offset: u64,
    opened: bool,
}

#[derive(Serialize, Deserialize)]
struct SourceCheckpoint {
    stream: StreamState,
    offset: u64,
}

impl<S: Source> SourceStage<S> {
    pub fn new(source: S) -> Self {
        Self {
            state: StreamState::new(),
            source,
            offset: 0,
            opened: false,
        }
    }

    /// Bytes delivered so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<S: Source> ByteStream for SourceStage<S> {
    fn state(&self) -> &StreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    fn produce_next(&mut self, _ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        if !self.opened {
            if let Err(e) = self.source.open(self.offset) {
                self.state.fail(format!("{e:#}"));
                return true;
            }
            tracing::debug!(source = self.source.id(), offset = self.offset, "source opened");
            self.opened = true;
        }
        match self.source.read_chunk() {
            Ok(Some(data)) if data.is_empty() => false,
            Ok(Some(data)) => {
                self.offset += data.len() as u64;
                let id = self.source.id().to_string();
                self.state.emit(data, &id);
                true
            }
            Ok(None) => {
                self.source.close();
                self.state.finish();
                false
            }
            Err(e) => {
                self.source.close();
                self.state.fail(format!("{e:#}"));
                true
            }
        }
    }

    fn kill(&mut self, code: i32) {
        self.source.close();
        self.state.kill(code);
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&SourceCheckpoint {
            stream: self.state.clone(),
            offset: self.offset,
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: SourceCheckpoint = checkpoint::load(state)?;
        self.source.close();
        self.state = saved.stream;
        self.offset = saved.offset;
        self.opened = false;
        Ok(())
    }
}
