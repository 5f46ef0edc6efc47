use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, StageState};
use crate::error::CheckpointError;
use crate::stream::{ByteStream, PipelineContext, StreamState};

/// Longest chunk-size line accepted, extensions included.
const MAX_SIZE_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Phase {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

/// Decodes an HTTP/1.1 `Transfer-Encoding: chunked` body.
pub struct ChunkedDecoder {
    state: StreamState,
    phase: Phase,
}

#[derive(Serialize, Deserialize)]
struct ChunkedCheckpoint {
    stream: StreamState,
    phase: Phase,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
            phase: Phase::Size,
        }
    }

    fn take_line(&mut self) -> Option<Bytes> {
        let end = self.state.input.windows(2).position(|w| w == b"\r\n")?;
        let line = self.state.input.split_to(end).freeze();
        let _ = self.state.input.split_to(2);
        Some(line)
    }

    fn step(&mut self) -> Result<Option<Bytes>, String> {
        loop {
            match self.phase {
                Phase::Size => {
                    let Some(line) = self.take_line() else {
                        if self.state.input.len() > MAX_SIZE_LINE {
                            return Err("chunk size line too long".into());
                        }
                        return Ok(None);
                    };
                    let text = std::str::from_utf8(&line).map_err(|e| e.to_string())?;
                    let digits = text.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(digits, 16)
                        .map_err(|_| format!("invalid chunk size {digits:?}"))?;
                    self.phase = if size == 0 {
                        Phase::Trailers
                    } else {
                        Phase::Data { remaining: size }
                    };
                }
                Phase::Data { remaining } => {
                    if self.state.input.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(self.state.input.len() as u64) as usize;
                    let data = self.state.input.split_to(n).freeze();
                    let remaining = remaining - n as u64;
                    self.phase = if remaining == 0 {
                        Phase::DataEnd
                    } else {
                        Phase::Data { remaining }
                    };
                    return Ok(Some(data));
                }
                Phase::DataEnd => {
                    if self.state.input.len() < 2 {
                        return Ok(None);
                    }
                    if &self.state.input[..2] != b"\r\n" {
                        return Err("missing CRLF after chunk data".into());
                    }
                    let _ = self.state.input.split_to(2);
                    self.phase = Phase::Size;
                }
                Phase::Trailers => {
                    let Some(line) = self.take_line() else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.phase = Phase::Done;
                    }
                }
                Phase::Done => {
                    self.state.input.clear();
                    return Ok(None);
                }
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for ChunkedDecoder {
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
        match self.step() {
            Ok(Some(data)) => {
                let file_id = self.state.input_context.file_id().to_string();
                self.state.emit(data, &file_id);
                true
            }
            Ok(None) => {
                if self.phase == Phase::Done {
                    self.state.finish();
                } else if self.state.input_done() {
                    self.state.fail("chunked body ended early");
                    return true;
                }
                false
            }
            Err(message) => {
                self.state.fail(message);
                true
            }
        }
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&ChunkedCheckpoint {
            stream: self.state.clone(),
            phase: self.phase,
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: ChunkedCheckpoint = checkpoint::load(state)?;
        self.state = saved.stream;
        self.phase = saved.phase;
        Ok(())
    }
}
