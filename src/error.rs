//! Error types for bytechain.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures while decoding a ZIP byte stream.
#[derive(Debug, Error)]
pub enum ZipError {
    #[error("invalid signature 0x{signature:08x} at offset {offset}")]
    InvalidSignature { signature: u32, offset: u64 },

    #[error("truncated archive at offset {offset}")]
    Truncated { offset: u64 },

    #[error("ZIP64 records are not supported ({context})")]
    Zip64Unsupported { context: String },

    #[error("multi-disk archives are not supported")]
    MultiDisk,

    #[error("unsupported compression method {method} for {path}")]
    UnsupportedMethod { method: u16, path: String },

    #[error("encrypted entries are not supported ({path})")]
    Encrypted { path: String },

    #[error("stored entry {path} has no size in its local header")]
    StreamingEntry { path: String },

    #[error("inflate failed for {path}: {message}")]
    Inflate { path: String, message: String },

    #[error("CRC mismatch for {path}: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
}

/// Failures attributed to a single HTTP request.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("HTTP status {code} {message}")]
    HttpStatus { code: u16, message: String },

    #[error("redirect limit exceeded ({limit} hops)")]
    TooManyRedirects { limit: u32 },

    #[error("no socket activity for {0:?}")]
    Timeout(Duration),
}

/// Failures while producing or restoring a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("checkpoint has no state for stage {0}")]
    MissingStage(String),

    #[error("checkpoint references unknown stage {0}")]
    UnknownStage(String),

    #[error("invalid checkpoint: {0}")]
    Invalid(String),

    #[error("deflate stream consumed more than {limit} bytes and cannot be checkpointed")]
    ReplayTooLarge { limit: usize },
}

/// Failures surfaced by a [`PipelineChain`](crate::PipelineChain).
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid chain: {0}")]
    Config(String),
}
