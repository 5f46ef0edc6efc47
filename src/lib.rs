//! # bytechain
//!
//! Resumable streaming pipelines over bytes.
//!
//! A pipeline is a [`PipelineChain`] of named stages implementing
//! [`ByteStream`]. Data moves one chunk at a time, depth-first, so every
//! stage buffers at most one undelivered chunk and a consumer never sees two
//! sub-streams (say, two archive members) interleaved. The whole chain can be
//! paused into a JSON-serializable [`PipelineCheckpoint`] and resumed later,
//! in another process if need be.
//!
//! ## Features
//!
//! - Concurrent HTTP/HTTPS downloads on one thread ([`RequestMultiplexer`],
//!   [`HttpSource`]) with a hard connection cap, bounded redirects and
//!   `Range`-based resumption
//! - Streaming ZIP decoding ([`ArchiveReader`]) for STORED and DEFLATE
//!   members, tolerant of any split point in its input
//! - Per-key fan-out with [`Demultiplexer`]
//! - Chunked transfer-encoding and deflate content-encoding stages
//! - URL rewriting through pluggable tokenizer contracts ([`text`])
//!
//! ## Example
//!
//! ```no_run
//! use bytechain::{
//!     ArchiveReader, ClientConfig, Demultiplexer, HttpSource, PipelineChain, Tick, Transform,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let source = HttpSource::from_urls(
//!         ClientConfig::default(),
//!         ["http://example.com/export.wxr.zip"],
//!     )?;
//!     let mut chain = PipelineChain::builder()
//!         .stage("http", source)
//!         .stage("unzip", Demultiplexer::new(ArchiveReader::new))
//!         .stage("upper", Transform::uppercase())
//!         .build()?;
//!
//!     loop {
//!         match chain.tick()? {
//!             Tick::Output(chunk) => print!("{}", String::from_utf8_lossy(&chunk.data)),
//!             Tick::Failed(failure) => eprintln!("{failure}"),
//!             Tick::Pending => {}
//!             Tick::Finished => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod cli;
pub mod codec;
pub mod error;
pub mod io;
pub mod net;
pub mod stream;
pub mod text;
pub mod zip;

pub use checkpoint::{PipelineCheckpoint, StageState};
pub use cli::Cli;
pub use codec::{ChunkedDecoder, InflateStage, Inflater};
pub use error::{ChainError, CheckpointError, NetError, ZipError};
pub use io::{HttpSource, LocalFileSource, Source, SourceStage};
pub use net::{ClientConfig, Event, Request, RequestId, RequestMultiplexer, RequestState};
pub use stream::{
    ByteStream, ChainBuilder, Chunk, Demultiplexer, FileFilter, InputContext, OutputChunk,
    PipelineChain, PipelineContext, StageFailure, StreamState, Tick, Transform,
};
pub use text::{TextRewriter, TokenProcessor, UrlProcessor};
pub use zip::{ArchiveReader, ZipCursor, ZipPhase};
