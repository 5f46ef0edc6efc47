use std::collections::{BTreeMap, HashSet};
use std::fmt;

use bytes::{Bytes, BytesMut};

use super::{ByteStream, Chunk, InputContext};
use crate::checkpoint::PipelineCheckpoint;
use crate::error::{ChainError, CheckpointError};

pub(crate) struct NamedStage {
    name: String,
    stage: Box<dyn ByteStream>,
}

/// Live view of the stages upstream of the one currently working.
///
/// Only valid for the duration of one `produce_next` call.
pub struct PipelineContext<'a> {
    stages: &'a mut [NamedStage],
}

impl<'a> PipelineContext<'a> {
    /// A context with no visible stages, for driving a stage by hand.
    pub fn detached() -> PipelineContext<'static> {
        PipelineContext { stages: &mut [] }
    }

    pub fn stage(&self, name: &str) -> Option<&dyn ByteStream> {
        for named in self.stages.iter() {
            if named.name == name {
                return Some(named.stage.as_ref());
            }
        }
        None
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut dyn ByteStream> {
        for named in self.stages.iter_mut() {
            if named.name == name {
                return Some(named.stage.as_mut());
            }
        }
        None
    }

    pub fn file_id(&self, name: &str) -> Option<&str> {
        self.stage(name).map(|stage| stage.file_id())
    }

    /// Asks the named stage to drop the rest of its current sub-stream.
    pub fn skip_current_file(&mut self, name: &str) -> bool {
        match self.stage_mut(name) {
            Some(stage) => {
                tracing::debug!(stage = name, file = stage.file_id(), "skipping current file");
                stage.skip_current_file();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|named| named.name.as_str())
    }
}

/// A chunk that left the terminal stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub file_id: String,
    pub data: Bytes,
}

/// A labeled stage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.message)
    }
}

/// Result of one [`PipelineChain::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// The terminal stage produced a chunk.
    Output(OutputChunk),
    /// A stage reported an error and the chain keeps going.
    Failed(StageFailure),
    /// Nothing reached the terminal stage this tick.
    Pending,
    /// The terminal stage is exhausted.
    Finished,
}

/// Builder for [`PipelineChain`].
#[derive(Default)]
pub struct ChainBuilder {
    stages: Vec<NamedStage>,
    stop_on_errors: bool,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage. Stage order is data-flow order.
    pub fn stage(self, name: impl Into<String>, stage: impl ByteStream + 'static) -> Self {
        self.boxed_stage(name, Box::new(stage))
    }

    pub fn boxed_stage(mut self, name: impl Into<String>, stage: Box<dyn ByteStream>) -> Self {
        self.stages.push(NamedStage {
            name: name.into(),
            stage,
        });
        self
    }

    /// End the chain on the first stage error instead of reporting and
    /// continuing.
    pub fn stop_on_errors(mut self, yes: bool) -> Self {
        self.stop_on_errors = yes;
        self
    }

    pub fn build(self) -> Result<PipelineChain, ChainError> {
        if self.stages.is_empty() {
            return Err(ChainError::Config("a chain needs at least one stage".into()));
        }
        let mut seen = HashSet::new();
        for named in &self.stages {
            if !seen.insert(named.name.as_str()) {
                return Err(ChainError::Config(format!(
                    "duplicate stage name {}",
                    named.name
                )));
            }
        }
        Ok(PipelineChain {
            stages: self.stages,
            stack: Vec::new(),
            input: BytesMut::new(),
            input_eof: false,
            eof_forwarded: false,
            stop_on_errors: self.stop_on_errors,
            finished: false,
        })
    }
}

/// An ordered list of named stages driven depth-first, one tick at a time.
///
/// A chunk produced by a stage is pushed through every downstream stage
/// before the stage is asked for more, so a consumer never sees two
/// sub-streams interleaved and each stage holds at most one chunk.
pub struct PipelineChain {
    stages: Vec<NamedStage>,
    /// Indices of stages that may still hold output, strictly increasing.
    stack: Vec<usize>,
    input: BytesMut,
    input_eof: bool,
    eof_forwarded: bool,
    stop_on_errors: bool,
    finished: bool,
}

impl PipelineChain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// Injects bytes in front of the first stage.
    pub fn append_input(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    pub fn signal_input_eof(&mut self) {
        self.input_eof = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True when no stage holds undelivered work and no injected input is
    /// waiting. Only sources that produce on their own can make progress.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && self.input.is_empty()
    }

    /// A context over every stage, for callers steering the chain between
    /// ticks.
    pub fn context(&mut self) -> PipelineContext<'_> {
        PipelineContext {
            stages: &mut self.stages,
        }
    }

    pub fn skip_current_file(&mut self, stage: &str) -> bool {
        self.context().skip_current_file(stage)
    }

    /// Closes every stage; later ticks report `Finished`.
    pub fn kill(&mut self, code: i32) {
        for named in &mut self.stages {
            named.stage.kill(code);
        }
        self.stack.clear();
        self.input.clear();
        self.finished = true;
    }

    pub fn tick(&mut self) -> Result<Tick, ChainError> {
        if self.finished {
            return Ok(Tick::Finished);
        }

        if !self.input.is_empty() {
            let data = self.input.split().freeze();
            self.stages[0]
                .stage
                .append_input(&data, &InputContext::default());
        }
        if self.input_eof && !self.eof_forwarded {
            self.stages[0].stage.signal_input_eof();
            self.eof_forwarded = true;
        }

        if self.stack.is_empty() {
            self.stack.push(0);
        }
        let last = self.stages.len() - 1;

        while let Some(index) = self.stack.pop() {
            if self.stages[index].stage.is_output_exhausted() {
                if index == last {
                    return Ok(self.finish());
                }
                // The stage below has nothing left; let the next one flush.
                self.stages[index + 1].stage.signal_input_eof();
                self.stack.push(index + 1);
                continue;
            }

            if !self.produce(index) {
                if self.stages[index].stage.is_output_exhausted() {
                    self.stack.push(index);
                }
                continue;
            }
            if let Some(tick) = self.check_error(index)? {
                return Ok(tick);
            }
            self.stack.push(index);

            let mut current = index;
            loop {
                if current == last {
                    return Ok(Tick::Output(self.terminal_chunk()));
                }
                self.forward(current);
                current += 1;

                if !self.produce(current) {
                    if self.stages[current].stage.is_output_exhausted() {
                        if current == last {
                            return Ok(self.finish());
                        }
                        self.stack.push(current);
                    }
                    return Ok(Tick::Pending);
                }
                if let Some(tick) = self.check_error(current)? {
                    return Ok(tick);
                }
                self.stack.push(current);
            }
        }

        Ok(Tick::Pending)
    }

    pub fn pause(&self) -> Result<PipelineCheckpoint, CheckpointError> {
        let mut stages = BTreeMap::new();
        for named in &self.stages {
            stages.insert(named.name.clone(), named.stage.pause()?);
        }
        Ok(PipelineCheckpoint {
            stages,
            execution_stack: self
                .stack
                .iter()
                .map(|&index| self.stages[index].name.clone())
                .collect(),
            pending_input: self.input.to_vec(),
            input_eof: self.input_eof,
            eof_forwarded: self.eof_forwarded,
            finished: self.finished,
        })
    }

    /// Restores a checkpoint taken from a chain with the same stage names.
    pub fn resume(&mut self, checkpoint: PipelineCheckpoint) -> Result<(), CheckpointError> {
        let PipelineCheckpoint {
            mut stages,
            execution_stack,
            pending_input,
            input_eof,
            eof_forwarded,
            finished,
        } = checkpoint;

        if let Some(unknown) = stages
            .keys()
            .find(|name| !self.stages.iter().any(|named| &named.name == *name))
        {
            return Err(CheckpointError::UnknownStage(unknown.clone()));
        }
        let mut stack = Vec::with_capacity(execution_stack.len());
        for name in &execution_stack {
            let index = self
                .position(name)
                .ok_or_else(|| CheckpointError::UnknownStage(name.clone()))?;
            if stack.last().is_some_and(|&top| top >= index) {
                return Err(CheckpointError::Invalid(format!(
                    "execution stack out of order at {name}"
                )));
            }
            stack.push(index);
        }

        for named in &mut self.stages {
            let state = stages
                .remove(&named.name)
                .ok_or_else(|| CheckpointError::MissingStage(named.name.clone()))?;
            named.stage.resume(state)?;
        }

        self.stack = stack;
        self.input = BytesMut::from(&pending_input[..]);
        self.input_eof = input_eof;
        self.eof_forwarded = eof_forwarded;
        self.finished = finished;
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|named| named.name == name)
    }

    fn produce(&mut self, index: usize) -> bool {
        let (upstream, rest) = self.stages.split_at_mut(index);
        let mut ctx = PipelineContext { stages: upstream };
        rest[0].stage.produce_next(&mut ctx)
    }

    /// Feeds the output of `index` into the stage after it.
    fn forward(&mut self, index: usize) {
        let (left, right) = self.stages.split_at_mut(index + 1);
        let from = &left[index];
        let Some(Chunk::Data(data)) = from.stage.output() else {
            return;
        };
        let mut context = from.stage.input_context().clone();
        context.push(&from.name, from.stage.file_id());
        tracing::trace!(from = %from.name, len = data.len(), "forwarding chunk");
        right[0].stage.append_input(data, &context);
    }

    fn check_error(&mut self, index: usize) -> Result<Option<Tick>, ChainError> {
        let Some(Chunk::Error(message)) = self.stages[index].stage.output() else {
            return Ok(None);
        };
        let failure = StageFailure {
            stage: self.stages[index].name.clone(),
            message: message.clone(),
        };
        tracing::warn!(stage = %failure.stage, "{failure}");

        if self.stop_on_errors {
            self.kill(1);
            return Err(ChainError::StageFailed {
                stage: failure.stage,
                message: failure.message,
            });
        }
        self.stack.push(index);
        Ok(Some(Tick::Failed(failure)))
    }

    fn terminal_chunk(&self) -> OutputChunk {
        let terminal = &self.stages[self.stages.len() - 1].stage;
        let data = match terminal.output() {
            Some(Chunk::Data(data)) => data.clone(),
            _ => Bytes::new(),
        };
        OutputChunk {
            file_id: terminal.file_id().to_string(),
            data,
        }
    }

    fn finish(&mut self) -> Tick {
        tracing::debug!("chain finished");
        self.finished = true;
        self.stack.clear();
        Tick::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FileFilter, Transform};

    fn upper() -> Transform {
        Transform::new(|_, bytes| bytes.to_ascii_uppercase())
    }

    fn drain(chain: &mut PipelineChain) -> Vec<Tick> {
        let mut ticks = Vec::new();
        loop {
            match chain.tick().unwrap() {
                Tick::Pending if chain.is_idle() => return ticks,
                Tick::Pending => {}
                Tick::Finished => {
                    ticks.push(Tick::Finished);
                    return ticks;
                }
                tick => ticks.push(tick),
            }
        }
    }

    #[test]
    fn rejects_empty_and_duplicate_chains() {
        assert!(matches!(
            PipelineChain::builder().build(),
            Err(ChainError::Config(_))
        ));
        assert!(matches!(
            PipelineChain::builder()
                .stage("a", upper())
                .stage("a", upper())
                .build(),
            Err(ChainError::Config(_))
        ));
    }

    #[test]
    fn passes_bytes_through_every_stage() {
        let mut chain = PipelineChain::builder()
            .stage("upper", upper())
            .stage("exclaim", Transform::new(|_, bytes| [bytes, &b"!"[..]].concat()))
            .build()
            .unwrap();

        chain.append_input(b"hello");
        let ticks = drain(&mut chain);
        assert_eq!(
            ticks,
            vec![Tick::Output(OutputChunk {
                file_id: "default".into(),
                data: Bytes::from_static(b"HELLO!"),
            })]
        );

        chain.signal_input_eof();
        assert_eq!(drain(&mut chain), vec![Tick::Finished]);
        assert!(chain.is_finished());
        assert_eq!(chain.tick().unwrap(), Tick::Finished);
    }

    #[test]
    fn kill_finishes_the_chain() {
        let mut chain = PipelineChain::builder().stage("upper", upper()).build().unwrap();
        chain.append_input(b"abc");
        chain.kill(9);
        assert_eq!(chain.tick().unwrap(), Tick::Finished);
    }

    #[test]
    fn context_exposes_upstream_by_name() {
        let mut chain = PipelineChain::builder()
            .stage("upper", upper())
            .stage("filter", FileFilter::new("upper", |_| true))
            .build()
            .unwrap();
        let names: Vec<_> = chain.context().names().map(String::from).collect();
        assert_eq!(names, ["upper", "filter"]);
        assert!(chain.skip_current_file("upper"));
        assert!(!chain.skip_current_file("missing"));
    }

    #[test]
    fn resume_rejects_foreign_checkpoints() {
        let chain = PipelineChain::builder().stage("upper", upper()).build().unwrap();
        let mut checkpoint = chain.pause().unwrap();
        checkpoint
            .stages
            .insert("zip".into(), serde_json::Value::Null);

        let mut other = PipelineChain::builder().stage("upper", upper()).build().unwrap();
        assert!(matches!(
            other.resume(checkpoint),
            Err(CheckpointError::UnknownStage(name)) if name == "zip"
        ));

        let mut bigger = PipelineChain::builder()
            .stage("upper", upper())
            .stage("lower", upper())
            .build()
            .unwrap();
        assert!(matches!(
            bigger.resume(chain.pause().unwrap()),
            Err(CheckpointError::MissingStage(name)) if name == "lower"
        ));
    }
}
