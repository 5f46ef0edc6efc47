//! DEFLATE decoding that can be checkpointed.
//!
//! `flate2`'s decompressor state cannot be serialized, and raw DEFLATE has no
//! byte-aligned restart points. An [`Inflater`] therefore remembers the
//! compressed bytes it consumed for the current stream; a checkpoint carries
//! them and [`Inflater::restore`] replays them through a fresh decompressor,
//! discarding the output that was already delivered.
//!
//! The replay buffer is capped at [`DEFAULT_REPLAY_LIMIT`] compressed bytes.
//! Past the cap the inflater stops recording and refuses to checkpoint until
//! its stream ends.

use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, StageState, b64};
use crate::error::CheckpointError;
use crate::stream::{ByteStream, PipelineContext, StreamState};

const MIN_OUTPUT: usize = 4096;

/// Compressed bytes an [`Inflater`] records for replay.
pub const DEFAULT_REPLAY_LIMIT: usize = 8 << 20;

pub struct Inflater {
    inner: Decompress,
    zlib_header: bool,
    replay: Vec<u8>,
    replay_limit: usize,
    overflowed: bool,
    finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflateCheckpoint {
    pub zlib_header: bool,
    #[serde(with = "b64")]
    pub replay: Vec<u8>,
    pub total_out: u64,
    #[serde(default = "default_replay_limit")]
    pub replay_limit: usize,
}

fn default_replay_limit() -> usize {
    DEFAULT_REPLAY_LIMIT
}

impl Inflater {
    /// Raw DEFLATE, as stored in ZIP members.
    pub fn raw() -> Self {
        Self::new(false)
    }

    /// zlib-wrapped DEFLATE, as sent with `Content-Encoding: deflate`.
    pub fn zlib() -> Self {
        Self::new(true)
    }

    fn new(zlib_header: bool) -> Self {
        Self {
            inner: Decompress::new(zlib_header),
            zlib_header,
            replay: Vec::new(),
            replay_limit: DEFAULT_REPLAY_LIMIT,
            overflowed: false,
            finished: false,
        }
    }

    pub fn with_replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = limit;
        self
    }

    /// Decompresses as much of `input` as the stream accepts.
    ///
    /// Returns how many input bytes were consumed and everything they
    /// decoded to. Consumption stops early only at the end of the stream.
    pub fn inflate(&mut self, input: &[u8]) -> Result<(usize, Vec<u8>), String> {
        let (consumed, output) = self.run(input)?;
        if !self.overflowed {
            if self.replay.len() + consumed > self.replay_limit {
                self.overflowed = true;
                self.replay = Vec::new();
            } else {
                self.replay.extend_from_slice(&input[..consumed]);
            }
        }
        Ok((consumed, output))
    }

    fn run(&mut self, input: &[u8]) -> Result<(usize, Vec<u8>), String> {
        let start_in = self.inner.total_in();
        let mut output = Vec::with_capacity(MIN_OUTPUT.max(input.len() * 3));
        loop {
            if self.finished {
                break;
            }
            let consumed = (self.inner.total_in() - start_in) as usize;
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(MIN_OUTPUT));
            }
            let before = (self.inner.total_in(), self.inner.total_out());
            let status = self
                .inner
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::None)
                .map_err(|e| e.to_string())?;

            if status == Status::StreamEnd {
                self.finished = true;
                break;
            }
            let consumed = (self.inner.total_in() - start_in) as usize;
            let stalled = before == (self.inner.total_in(), self.inner.total_out());
            let room_left = output.len() < output.capacity();
            if room_left && (consumed == input.len() || stalled) {
                break;
            }
        }
        Ok(((self.inner.total_in() - start_in) as usize, output))
    }

    /// The end-of-stream marker has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn total_out(&self) -> u64 {
        self.inner.total_out()
    }

    /// Compressed bytes currently held for replay.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Fails once the stream outgrew the replay limit.
    pub fn checkpoint(&self) -> Result<InflateCheckpoint, CheckpointError> {
        if self.overflowed {
            return Err(CheckpointError::ReplayTooLarge {
                limit: self.replay_limit,
            });
        }
        Ok(InflateCheckpoint {
            zlib_header: self.zlib_header,
            replay: self.replay.clone(),
            total_out: self.inner.total_out(),
            replay_limit: self.replay_limit,
        })
    }

    /// Rebuilds an inflater positioned exactly where the checkpoint was taken.
    pub fn restore(saved: InflateCheckpoint) -> Result<Self, String> {
        let mut inflater = Self::new(saved.zlib_header).with_replay_limit(saved.replay_limit);
        let (consumed, _) = inflater.run(&saved.replay)?;
        if consumed != saved.replay.len() || inflater.total_out() != saved.total_out {
            return Err(format!(
                "replay mismatch: consumed {consumed} of {} bytes, produced {} of {}",
                saved.replay.len(),
                inflater.total_out(),
                saved.total_out
            ));
        }
        inflater.replay = saved.replay;
        Ok(inflater)
    }
}

/// A stage decoding a `Content-Encoding: deflate` body.
pub struct InflateStage {
    state: StreamState,
    inflater: Inflater,
}

#[derive(Serialize, Deserialize)]
struct InflateStageCheckpoint {
    stream: StreamState,
    inflate: InflateCheckpoint,
}

impl InflateStage {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
            inflater: Inflater::zlib(),
        }
    }
}

impl Default for InflateStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for InflateStage {
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
        if self.inflater.is_finished() {
            // Anything after the end-of-stream marker is not ours to decode.
            self.state.input.clear();
            if self.state.input_eof {
                self.state.finish();
            }
            return false;
        }
        if self.state.input.is_empty() {
            if self.state.input_eof {
                self.state.fail("deflate stream ended early");
                return true;
            }
            return false;
        }
        match self.inflater.inflate(&self.state.input) {
            Ok((consumed, output)) => {
                let _ = self.state.input.split_to(consumed);
                if output.is_empty() {
                    return false;
                }
                let file_id = self.state.input_context.file_id().to_string();
                self.state.emit(Bytes::from(output), &file_id);
                true
            }
            Err(message) => {
                self.state.fail(format!("inflate failed: {message}"));
                true
            }
        }
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&InflateStageCheckpoint {
            stream: self.state.clone(),
            inflate: self.inflater.checkpoint()?,
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: InflateStageCheckpoint = checkpoint::load(state)?;
        self.inflater = Inflater::restore(saved.inflate).map_err(CheckpointError::Invalid)?;
        self.state = saved.stream;
        Ok(())
    }
}
