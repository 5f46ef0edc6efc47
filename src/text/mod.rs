//! URL rewriting over structured text.
//!
//! This module does not tokenize HTML/XML or find URLs itself. It drives two
//! collaborators through narrow contracts: a [`TokenProcessor`] that walks a
//! document and lets the caller replace the text of the current token, and
//! a [`UrlProcessor`] that walks the URLs inside one piece of text.
//! [`TextRewriter`] wires them into a pipeline stage.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, StageState, b64};
use crate::error::CheckpointError;
use crate::stream::{ByteStream, InputContext, PipelineContext, StreamState};

/// Walks the tokens of a structured document.
pub trait TokenProcessor {
    /// Advances to the next token. Returns `false` at the end.
    fn next_token(&mut self) -> bool;

    /// Text of the current token that may be rewritten (text nodes,
    /// attribute values, CDATA).
    fn modifiable_text(&self) -> String;

    fn set_modifiable_text(&mut self, text: &str) -> bool;

    /// Path of open elements down to the current token.
    fn breadcrumbs(&self) -> Vec<String>;

    /// The document with every replacement applied.
    fn updated_document(&self) -> String;
}

/// Walks the URLs inside a piece of text.
pub trait UrlProcessor {
    fn next_url(&mut self) -> bool;

    fn url(&self) -> String;

    fn set_url(&mut self, url: &str) -> bool;

    /// The text with every replacement applied.
    fn updated_text(&self) -> String;
}

pub type TokenProcessorFactory = Box<dyn Fn(String) -> Box<dyn TokenProcessor>>;
pub type UrlProcessorFactory = Box<dyn Fn(String) -> Box<dyn UrlProcessor>>;

/// Maps `(url, breadcrumbs)` to a replacement URL, or `None` to keep it.
pub type UrlMapping = Box<dyn Fn(&str, &[String]) -> Option<String>>;

/// Rewrites URLs inside each document passing through.
///
/// Documents are buffered whole, one per upstream file id, because a token
/// or a URL may straddle chunk boundaries. A document is complete when bytes
/// for a different file id arrive or the input ends. A skipped document stays
/// skipped: its later bytes are dropped until another file id shows up.
pub struct TextRewriter {
    state: StreamState,
    tokens: TokenProcessorFactory,
    urls: UrlProcessorFactory,
    mapping: UrlMapping,
    document: BytesMut,
    document_id: Option<String>,
    skipped: Option<String>,
    complete: VecDeque<Document>,
}

#[derive(Serialize, Deserialize)]
struct Document {
    file_id: String,
    #[serde(with = "b64")]
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RewriterCheckpoint {
    stream: StreamState,
    #[serde(with = "b64")]
    document: Vec<u8>,
    document_id: Option<String>,
    #[serde(default)]
    skipped: Option<String>,
    complete: Vec<Document>,
}

impl TextRewriter {
    pub fn new(tokens: TokenProcessorFactory, urls: UrlProcessorFactory, mapping: UrlMapping) -> Self {
        Self {
            state: StreamState::new(),
            tokens,
            urls,
            mapping,
            document: BytesMut::new(),
            document_id: None,
            skipped: None,
            complete: VecDeque::new(),
        }
    }

    fn close_document(&mut self) {
        if let Some(file_id) = self.document_id.take() {
            let bytes = self.document.split().to_vec();
            self.complete.push_back(Document { file_id, bytes });
        }
    }

    fn rewrite(&self, document: &[u8]) -> String {
        let mut tokens = (self.tokens)(String::from_utf8_lossy(document).into_owned());
        let mut rewritten = 0usize;
        while tokens.next_token() {
            let text = tokens.modifiable_text();
            if text.is_empty() {
                continue;
            }
            let breadcrumbs = tokens.breadcrumbs();
            let mut urls = (self.urls)(text);
            let mut changed = false;
            while urls.next_url() {
                if let Some(replacement) = (self.mapping)(&urls.url(), &breadcrumbs) {
                    changed |= urls.set_url(&replacement);
                }
            }
            if changed && tokens.set_modifiable_text(&urls.updated_text()) {
                rewritten += 1;
            }
        }
        tracing::trace!(rewritten, "document rewritten");
        tokens.updated_document()
    }
}

impl ByteStream for TextRewriter {
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
        let file_id = context.file_id();
        if self.skipped.as_deref() == Some(file_id) {
            tracing::trace!(file_id, len = bytes.len(), "dropping bytes of skipped document");
            return;
        }
        self.skipped = None;
        if self.document_id.as_deref() != Some(file_id) {
            self.close_document();
            self.document_id = Some(file_id.to_string());
        }
        self.document.extend_from_slice(bytes);
        self.state.input_context = context.clone();
    }

    fn produce_next(&mut self, _ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        if self.complete.is_empty() && self.state.input_eof {
            self.close_document();
        }
        let Some(document) = self.complete.pop_front() else {
            if self.state.input_eof {
                self.state.finish();
            }
            return false;
        };
        let output = self.rewrite(&document.bytes);
        self.state.emit(Bytes::from(output), &document.file_id);
        true
    }

    fn skip_current_file(&mut self) {
        self.document.clear();
        self.skipped = self.document_id.take();
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&RewriterCheckpoint {
            stream: self.state.clone(),
            document: self.document.to_vec(),
            document_id: self.document_id.clone(),
            skipped: self.skipped.clone(),
            complete: self
                .complete
                .iter()
                .map(|document| Document {
                    file_id: document.file_id.clone(),
                    bytes: document.bytes.clone(),
                })
                .collect(),
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: RewriterCheckpoint = checkpoint::load(state)?;
        self.state = saved.stream;
        self.document = BytesMut::from(&saved.document[..]);
        self.document_id = saved.document_id;
        self.skipped = saved.skipped;
        self.complete = saved.complete.into();
        Ok(())
    }
}
