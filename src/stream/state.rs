use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{Chunk, DEFAULT_FILE_ID, InputContext, Lifecycle};
use crate::checkpoint::b64;

/// Buffers and lifecycle shared by every stage.
///
/// The output slot is deliberately not serialized: by the time a checkpoint
/// is taken every produced chunk has already been handed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(with = "b64")]
    pub input: BytesMut,
    pub input_context: InputContext,
    pub input_eof: bool,
    #[serde(skip)]
    pub output: Option<Chunk>,
    pub file_id: String,
    pub last_error: Option<String>,
    pub lifecycle: Lifecycle,
    pub exit_code: Option<i32>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            input: BytesMut::new(),
            input_context: InputContext::default(),
            input_eof: false,
            output: None,
            file_id: DEFAULT_FILE_ID.to_string(),
            last_error: None,
            lifecycle: Lifecycle::Streaming,
            exit_code: None,
        }
    }

    pub fn append(&mut self, bytes: &[u8], context: &InputContext) {
        if self.lifecycle == Lifecycle::Finished {
            tracing::trace!(len = bytes.len(), "dropping input for finished stage");
            return;
        }
        self.input.extend_from_slice(bytes);
        if &self.input_context != context {
            self.input_context = context.clone();
        }
    }

    /// Clears the output slot. Returns whether the stage may still work.
    pub fn begin_tick(&mut self) -> bool {
        self.output = None;
        self.lifecycle == Lifecycle::Streaming
    }

    pub fn emit(&mut self, data: Bytes, file_id: &str) {
        if self.file_id != file_id {
            self.file_id = file_id.to_string();
        }
        self.output = Some(Chunk::Data(data));
    }

    /// Publishes an error chunk without ending the stream.
    pub fn emit_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.output = Some(Chunk::Error(message));
    }

    /// Publishes an error chunk and finishes the stream.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.emit_error(message);
        self.lifecycle = Lifecycle::Finished;
        self.input.clear();
    }

    pub fn finish(&mut self) {
        self.lifecycle = Lifecycle::Finished;
    }

    pub fn kill(&mut self, code: i32) {
        self.exit_code = Some(code);
        self.lifecycle = Lifecycle::Finished;
        self.input.clear();
        self.output = None;
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle == Lifecycle::Finished
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_finished() && self.output.is_none()
    }

    /// Input is drained and no more will arrive.
    pub fn input_done(&self) -> bool {
        self.input_eof && self.input.is_empty()
    }

    pub fn take_input(&mut self) -> Bytes {
        self.input.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_slot_is_cleared_every_tick() {
        let mut state = StreamState::new();
        state.emit(Bytes::from_static(b"abc"), "a.txt");
        assert!(state.output.is_some());
        assert!(state.begin_tick());
        assert!(state.output.is_none());
        assert_eq!(state.file_id, "a.txt");
    }

    #[test]
    fn finished_is_terminal() {
        let mut state = StreamState::new();
        state.fail("boom");
        assert!(!state.is_exhausted(), "error chunk still pending");
        assert!(!state.begin_tick());
        assert!(state.is_exhausted());
        assert_eq!(state.last_error.as_deref(), Some("boom"));

        state.append(b"late", &InputContext::default());
        assert!(state.input.is_empty());
    }

    #[test]
    fn survives_json_without_output() {
        let mut state = StreamState::new();
        state.append(b"pending", &InputContext::default());
        state.emit(Bytes::from_static(b"delivered"), "x");

        let json = serde_json::to_string(&state).unwrap();
        let restored: StreamState = serde_json::from_str(&json).unwrap();
        assert_eq!(&restored.input[..], b"pending");
        assert_eq!(restored.file_id, "x");
        assert!(restored.output.is_none());
    }
}
