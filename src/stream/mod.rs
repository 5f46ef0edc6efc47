//! The byte stream contract every pipeline stage implements.
//!
//! A stage is a small state machine over buffered bytes. The caller appends
//! input, asks for one unit of work with [`ByteStream::produce_next`], and
//! reads at most one output chunk back. A stage never blocks: when it needs
//! more bytes than are buffered it returns `false` and waits for the next
//! [`ByteStream::append_input`].
//!
//! ## Lifecycle
//!
//! ```text
//! Streaming --(input EOF drained / kill / fatal error)--> Finished
//! ```
//!
//! `Finished` is terminal. The output slot is cleared at the start of every
//! `produce_next` call, so a stage never buffers more than one undelivered
//! chunk.

mod chain;
mod demux;
mod state;
mod transform;

pub use chain::{ChainBuilder, OutputChunk, PipelineChain, PipelineContext, StageFailure, Tick};
pub use demux::{Demultiplexer, StageFactory};
pub use state::StreamState;
pub use transform::{FileFilter, Transform};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::checkpoint::StageState;
use crate::error::CheckpointError;

/// Sub-stream identity used when a stage does not distinguish sub-streams.
pub const DEFAULT_FILE_ID: &str = "default";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Streaming,
    Finished,
}

/// One unit of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    /// A stage-local failure travelling downstream instead of silently
    /// stopping the stream.
    Error(String),
}

/// The lineage of a piece of input: which upstream stage produced it, and
/// under which file id, all the way back to the chain's source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputContext {
    upstream: Vec<(String, String)>,
}

impl InputContext {
    pub fn push(&mut self, stage: &str, file_id: &str) {
        self.upstream.push((stage.to_string(), file_id.to_string()));
    }

    /// File id of the nearest upstream stage.
    pub fn file_id(&self) -> &str {
        self.upstream
            .last()
            .map(|(_, file_id)| file_id.as_str())
            .unwrap_or(DEFAULT_FILE_ID)
    }

    /// File id reported by the named upstream stage.
    pub fn file_id_of(&self, stage: &str) -> Option<&str> {
        self.upstream
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, file_id)| file_id.as_str())
    }

    /// All upstream file ids joined with `:`, or `"default"` for the source.
    pub fn key(&self) -> String {
        if self.upstream.is_empty() {
            return DEFAULT_FILE_ID.to_string();
        }
        self.upstream
            .iter()
            .map(|(_, file_id)| file_id.as_str())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }
}

/// A composable pipeline stage.
///
/// Implementors embed a [`StreamState`] and expose it through
/// [`state`](ByteStream::state) / [`state_mut`](ByteStream::state_mut); the
/// provided methods cover the buffering half of the contract.
pub trait ByteStream {
    fn state(&self) -> &StreamState;

    fn state_mut(&mut self) -> &mut StreamState;

    /// Attempts exactly one unit of work. Returns `true` when
    /// [`output`](ByteStream::output) holds a fresh chunk.
    fn produce_next(&mut self, ctx: &mut PipelineContext<'_>) -> bool;

    /// Serializes everything needed to continue later.
    fn pause(&self) -> Result<StageState, CheckpointError>;

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError>;

    fn append_input(&mut self, bytes: &[u8], context: &InputContext) {
        self.state_mut().append(bytes, context);
    }

    fn signal_input_eof(&mut self) {
        self.state_mut().input_eof = true;
    }

    fn output(&self) -> Option<&Chunk> {
        self.state().output.as_ref()
    }

    fn is_output_exhausted(&self) -> bool {
        self.state().is_exhausted()
    }

    /// Sub-stream identity of the most recent output.
    fn file_id(&self) -> &str {
        &self.state().file_id
    }

    /// Lineage of the input the most recent output was made from.
    fn input_context(&self) -> &InputContext {
        &self.state().input_context
    }

    fn last_error(&self) -> Option<&str> {
        self.state().last_error.as_deref()
    }

    /// Advisory: discard the rest of the sub-stream currently being produced.
    fn skip_current_file(&mut self) {}

    fn kill(&mut self, code: i32) {
        self.state_mut().kill(code);
    }
}
