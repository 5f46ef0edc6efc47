//! Byte sources feeding the first stage of a chain.

mod http;
mod local;

pub use http::HttpSource;
pub use local::{LocalFileSource, SourceStage};

use anyhow::Result;
use bytes::Bytes;

/// A pull-based byte source with an explicit open/read/close lifecycle.
pub trait Source {
    /// Opens the source positioned `offset` bytes from its start.
    fn open(&mut self, offset: u64) -> Result<()>;

    /// Reads the next chunk. `Ok(None)` is end of data; an empty chunk means
    /// nothing is available right now.
    fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    fn close(&mut self);

    /// Identity used as the file id of everything this source produces.
    fn id(&self) -> &str;
}
