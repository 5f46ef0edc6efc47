//! Transfer and content decoding stages for HTTP bodies.

mod chunked;
mod inflate;

pub use chunked::ChunkedDecoder;
pub use inflate::{DEFAULT_REPLAY_LIMIT, InflateCheckpoint, InflateStage, Inflater};
