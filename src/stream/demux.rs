use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{ByteStream, Chunk, InputContext, PipelineContext, StreamState};
use crate::checkpoint::{self, StageState};
use crate::error::CheckpointError;

/// Finished keys remembered so their late input can be dropped.
const MAX_RETIRED: usize = 256;

/// Builds a fresh child stage for a new key.
pub type StageFactory = Box<dyn Fn() -> Box<dyn ByteStream>>;

/// Fans one input carrying many sub-streams out to one child stage per key,
/// and fans the children's output back into a single stream.
///
/// Children are created lazily the first time their key shows up and are
/// pruned once exhausted. `produce_next` always drives the child that most
/// recently received input.
pub struct Demultiplexer {
    state: StreamState,
    factory: StageFactory,
    key_of: fn(&InputContext) -> String,
    children: BTreeMap<String, Box<dyn ByteStream>>,
    /// Oldest first, at most [`MAX_RETIRED`].
    retired: VecDeque<String>,
    active: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct DemuxCheckpoint {
    stream: StreamState,
    children: BTreeMap<String, StageState>,
    retired: VecDeque<String>,
    active: Option<String>,
}

impl Demultiplexer {
    pub fn new<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + 'static,
        S: ByteStream + 'static,
    {
        Self::from_factory(Box::new(move || Box::new(factory()) as Box<dyn ByteStream>))
    }

    pub fn from_factory(factory: StageFactory) -> Self {
        Self {
            state: StreamState::new(),
            factory,
            key_of: InputContext::key,
            children: BTreeMap::new(),
            retired: VecDeque::new(),
            active: None,
        }
    }

    /// Replaces the default lineage key.
    pub fn with_key(mut self, key_of: fn(&InputContext) -> String) -> Self {
        self.key_of = key_of;
        self
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn retire(&mut self, key: &str) {
        if self.retired.len() == MAX_RETIRED {
            self.retired.pop_front();
        }
        self.retired.push_back(key.to_string());
    }

    /// Drives one child. Returns whether it produced a chunk.
    fn poll_child(&mut self, key: &str, ctx: &mut PipelineContext<'_>) -> bool {
        let Some(child) = self.children.get_mut(key) else {
            return false;
        };
        if child.produce_next(ctx) {
            match child.output() {
                Some(Chunk::Data(data)) => {
                    let data = data.clone();
                    let file_id = child.file_id().to_string();
                    self.state.emit(data, &file_id);
                }
                Some(Chunk::Error(message)) => {
                    let message = format!("{key}: {message}");
                    self.state.emit_error(message);
                }
                None => return false,
            }
            return true;
        }
        if child.is_output_exhausted() {
            tracing::trace!(key, "pruning finished child");
            self.children.remove(key);
            self.retire(key);
            if self.active.as_deref() == Some(key) {
                self.active = None;
            }
        }
        false
    }
}

impl ByteStream for Demultiplexer {
    fn state(&self) -> &StreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    fn append_input(&mut self, bytes: &[u8], context: &InputContext) {
        if self.state.is_finished() {
            return;
        }
        let key = (self.key_of)(context);
        if self.retired.contains(&key) {
            tracing::debug!(key, len = bytes.len(), "dropping input for finished key");
            return;
        }
        let child = self.children.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(key, "creating child stage");
            (self.factory)()
        });
        child.append_input(bytes, context);
        self.active = Some(key);
    }

    fn produce_next(&mut self, ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        if let Some(key) = self.active.clone() {
            if self.poll_child(&key, ctx) {
                return true;
            }
        }
        if !self.state.input_eof {
            return false;
        }

        let keys: Vec<String> = self.children.keys().cloned().collect();
        for key in keys {
            if let Some(child) = self.children.get_mut(&key) {
                child.signal_input_eof();
            }
            self.active = Some(key.clone());
            if self.poll_child(&key, ctx) {
                return true;
            }
        }
        if self.children.is_empty() {
            self.state.finish();
        }
        false
    }

    fn input_context(&self) -> &InputContext {
        self.active
            .as_ref()
            .and_then(|key| self.children.get(key))
            .map(|child| child.input_context())
            .unwrap_or(&self.state.input_context)
    }

    fn skip_current_file(&mut self) {
        if let Some(child) = self
            .active
            .as_ref()
            .and_then(|key| self.children.get_mut(key))
        {
            child.skip_current_file();
        }
    }

    fn kill(&mut self, code: i32) {
        for child in self.children.values_mut() {
            child.kill(code);
        }
        self.children.clear();
        self.active = None;
        self.state.kill(code);
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        let mut children = BTreeMap::new();
        for (key, child) in &self.children {
            children.insert(key.clone(), child.pause()?);
        }
        checkpoint::save(&DemuxCheckpoint {
            stream: self.state.clone(),
            children,
            retired: self.retired.clone(),
            active: self.active.clone(),
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: DemuxCheckpoint = checkpoint::load(state)?;
        let mut children = BTreeMap::new();
        for (key, child_state) in saved.children {
            let mut child = (self.factory)();
            child.resume(child_state)?;
            children.insert(key, child);
        }
        self.state = saved.stream;
        self.children = children;
        self.retired = saved.retired;
        self.active = saved.active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Lifecycle, Transform};
    use bytes::Bytes;

    /// Emits its first input, then finishes.
    struct OneShot(StreamState);

    impl ByteStream for OneShot {
        fn state(&self) -> &StreamState {
            &self.0
        }

        fn state_mut(&mut self) -> &mut StreamState {
            &mut self.0
        }

        fn produce_next(&mut self, _ctx: &mut PipelineContext<'_>) -> bool {
            if !self.0.begin_tick() || self.0.input.is_empty() {
                return false;
            }
            let data = self.0.take_input();
            let file_id = self.0.input_context.file_id().to_string();
            self.0.emit(data, &file_id);
            self.0.finish();
            true
        }

        fn pause(&self) -> Result<StageState, CheckpointError> {
            checkpoint::save(&self.0)
        }

        fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
            self.0 = checkpoint::load(state)?;
            Ok(())
        }
    }

    fn context(file_id: &str) -> InputContext {
        let mut ctx = InputContext::default();
        ctx.push("source", file_id);
        ctx
    }

    fn tagging_demux() -> Demultiplexer {
        Demultiplexer::new(|| Transform::new(|file_id, bytes| [file_id.as_bytes(), &b"="[..], bytes].concat()))
    }

    fn data(demux: &Demultiplexer) -> Bytes {
        match demux.output() {
            Some(Chunk::Data(data)) => data.clone(),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn routes_each_key_to_its_own_child() {
        let mut demux = tagging_demux();
        let mut ctx = PipelineContext::detached();

        demux.append_input(b"one", &context("a"));
        assert!(demux.produce_next(&mut ctx));
        assert_eq!(&data(&demux)[..], b"a=one");
        assert_eq!(demux.file_id(), "a");

        demux.append_input(b"two", &context("b"));
        assert!(demux.produce_next(&mut ctx));
        assert_eq!(&data(&demux)[..], b"b=two");
        assert_eq!(demux.child_count(), 2);
        assert_eq!(demux.input_context().key(), "b");

        assert!(!demux.produce_next(&mut ctx));
    }

    #[test]
    fn drains_and_prunes_children_on_eof() {
        let mut demux = tagging_demux();
        let mut ctx = PipelineContext::detached();
        demux.append_input(b"x", &context("a"));
        demux.append_input(b"y", &context("b"));

        // Only "b" was written last, so "a" still holds its input.
        assert!(demux.produce_next(&mut ctx));
        assert_eq!(&data(&demux)[..], b"b=y");

        demux.signal_input_eof();
        assert!(demux.produce_next(&mut ctx));
        assert_eq!(&data(&demux)[..], b"a=x");

        while demux.produce_next(&mut ctx) {}
        assert_eq!(demux.child_count(), 0);
        assert_eq!(demux.state().lifecycle, Lifecycle::Finished);
        assert!(demux.is_output_exhausted());
    }

    #[test]
    fn checkpoint_restores_children() {
        let mut demux = tagging_demux();
        demux.append_input(b"pending", &context("a"));

        let saved = demux.pause().unwrap();
        let json = serde_json::to_string(&saved).unwrap();

        let mut restored = tagging_demux();
        restored.resume(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.child_count(), 1);

        let mut ctx = PipelineContext::detached();
        assert!(restored.produce_next(&mut ctx));
        assert_eq!(&data(&restored)[..], b"a=pending");
    }

    #[test]
    fn retired_keys_are_bounded() {
        let mut demux = Demultiplexer::new(|| OneShot(StreamState::new()));
        let mut ctx = PipelineContext::detached();
        for i in 0..MAX_RETIRED + 10 {
            demux.append_input(b"x", &context(&i.to_string()));
            assert!(demux.produce_next(&mut ctx));
            assert!(!demux.produce_next(&mut ctx));
        }
        assert_eq!(demux.child_count(), 0);
        assert_eq!(demux.retired.len(), MAX_RETIRED);

        let newest = (MAX_RETIRED + 9).to_string();
        demux.append_input(b"late", &context(&newest));
        assert_eq!(demux.child_count(), 0);

        // The oldest keys were forgotten, so they start a fresh child.
        demux.append_input(b"again", &context("0"));
        assert_eq!(demux.child_count(), 1);
        assert!(demux.produce_next(&mut ctx));
        assert_eq!(&data(&demux)[..], b"again");
    }
}
