use bytes::Bytes;

use super::{ByteStream, PipelineContext, StreamState};
use crate::checkpoint::{self, StageState};
use crate::error::CheckpointError;

/// Maps every input chunk through a function of `(file_id, bytes)`.
///
/// The function is stateless, so the checkpoint is just the buffered input.
pub struct Transform {
    state: StreamState,
    map: Box<dyn Fn(&str, &[u8]) -> Vec<u8>>,
}

impl Transform {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Vec<u8> + 'static,
    {
        Self {
            state: StreamState::new(),
            map: Box::new(map),
        }
    }

    /// ASCII upper-casing; multi-byte UTF-8 sequences pass through untouched.
    pub fn uppercase() -> Self {
        Self::new(|_, bytes| bytes.to_ascii_uppercase())
    }

    /// Passes bytes through unchanged.
    pub fn identity() -> Self {
        Self::new(|_, bytes| bytes.to_vec())
    }
}

impl ByteStream for Transform {
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
        if self.state.input.is_empty() {
            if self.state.input_eof {
                self.state.finish();
            }
            return false;
        }
        let input = self.state.take_input();
        let file_id = self.state.input_context.file_id().to_string();
        let output = (self.map)(&file_id, &input);
        self.state.emit(Bytes::from(output), &file_id);
        true
    }

    fn skip_current_file(&mut self) {
        self.state.input.clear();
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&self.state)
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        self.state = checkpoint::load(state)?;
        Ok(())
    }
}

/// Lets through only the sub-streams whose file id satisfies a predicate.
///
/// Rejected files are not just dropped here: the named upstream stage is
/// asked to skip them, so an archive reader stops decompressing a member
/// nobody wants.
pub struct FileFilter {
    state: StreamState,
    upstream: String,
    accept: Box<dyn Fn(&str) -> bool>,
}

impl FileFilter {
    pub fn new<F>(upstream: impl Into<String>, accept: F) -> Self
    where
        F: Fn(&str) -> bool + 'static,
    {
        Self {
            state: StreamState::new(),
            upstream: upstream.into(),
            accept: Box::new(accept),
        }
    }
}

impl ByteStream for FileFilter {
    fn state(&self) -> &StreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    fn produce_next(&mut self, ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        if self.state.input.is_empty() {
            if self.state.input_eof {
                self.state.finish();
            }
            return false;
        }
        let input = self.state.take_input();
        let file_id = self
            .state
            .input_context
            .file_id_of(&self.upstream)
            .unwrap_or_else(|| self.state.input_context.file_id())
            .to_string();

        if !(self.accept)(&file_id) {
            ctx.skip_current_file(&self.upstream);
            return false;
        }
        let own_id = self.state.input_context.file_id().to_string();
        self.state.emit(input, &own_id);
        true
    }

    fn skip_current_file(&mut self) {
        self.state.input.clear();
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&self.state)
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        self.state = checkpoint::load(state)?;
        Ok(())
    }
}
