//! Non-blocking HTTP/1.1 client.
//!
//! [`RequestMultiplexer`] keeps up to `concurrency` requests in flight on one
//! thread and reports their progress as a flat stream of [`Event`]s. Each
//! request gets its own connection (`Connection: close`, no reuse).
//! Redirects are followed up to a fixed number of hops; failures stay local
//! to the request that caused them.

mod connection;
mod multiplexer;
mod request;
mod response;

pub use multiplexer::{
    ClientConfig, DEFAULT_CONCURRENCY, DEFAULT_MAX_REDIRECTS, DEFAULT_POLL_TIMEOUT, Event,
    RequestMultiplexer,
};
pub use request::{Request, RequestId, RequestState, Target};
pub use response::{ResponseHead, Status, build_request, find_header_end};
