//! Streaming ZIP decoding.
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! The reader here never seeks. It decodes members as their local headers
//! go by and treats the Central Directory and EOCD as records to step over,
//! so an archive can be unpacked while it is still downloading.
//!
//! ## Supported Features
//!
//! - STORED (no compression) method
//! - DEFLATE compression method, including streamed members that carry a
//!   data descriptor
//! - CRC-32 verification
//!
//! ## Limitations
//!
//! - No ZIP64 support
//! - No encryption support
//! - No multi-disk archive support
//! - No BZIP2, LZMA, or other compression methods

mod reader;
mod structures;

pub use reader::{ArchiveReader, DEFAULT_CHUNK_SIZE, ZipCursor, ZipPhase};
pub use structures::*;
