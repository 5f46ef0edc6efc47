//! Streaming ZIP decoding.
//!
//! [`ArchiveReader`] walks an archive front to back without ever seeking:
//! local file headers announce each member, member data is stored or raw
//! DEFLATE, and the central directory at the end is recognized and skipped.
//! Every record may arrive split at any byte; the reader waits for more
//! input instead of failing, and its [`ZipCursor`] remembers exactly where
//! parsing stopped.

use bytes::Bytes;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::structures::{
    CentralDirectoryHeader, CompressionMethod, DataDescriptor, EndOfCentralDirectory,
    LocalFileHeader, Signature,
};
use crate::checkpoint::{self, StageState};
use crate::codec::{DEFAULT_REPLAY_LIMIT, InflateCheckpoint, Inflater};
use crate::error::{CheckpointError, ZipError};
use crate::stream::{ByteStream, PipelineContext, StreamState};

/// Compressed bytes handed to the decoder per step.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZipPhase {
    Scan,
    FileEntry,
    DataDescriptor,
    CentralDirEntry,
    EndCentralDirEntry,
    Complete,
    Error,
}

/// Position of the reader inside the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipCursor {
    /// Archive bytes consumed so far. Never decreases.
    pub bytes_parsed: u64,
    pub phase: ZipPhase,
    /// Header of the member being read, once parsed.
    pub header: Option<LocalFileHeader>,
    /// Compressed bytes of the current member consumed so far.
    pub member_consumed: u64,
    /// Decoded bytes of the current member produced so far.
    pub member_produced: u64,
    /// Running CRC-32 of the current member.
    pub crc: u32,
    pub skipping: bool,
    /// The last step stopped because a record was not fully buffered.
    pub paused_at_incomplete_input: bool,
    pub entries_seen: u32,
}

impl Default for ZipCursor {
    fn default() -> Self {
        Self {
            bytes_parsed: 0,
            phase: ZipPhase::Scan,
            header: None,
            member_consumed: 0,
            member_produced: 0,
            crc: 0,
            skipping: false,
            paused_at_incomplete_input: false,
            entries_seen: 0,
        }
    }
}

enum Step {
    Emit(Bytes),
    Continue,
    NeedInput,
    Done,
}

/// A stage turning ZIP archive bytes into the bytes of its members, one
/// member after another, each tagged with the member path as file id.
pub struct ArchiveReader {
    state: StreamState,
    cursor: ZipCursor,
    inflater: Option<Inflater>,
    chunk_size: usize,
    replay_limit: usize,
    verify_crc: bool,
}

#[derive(Serialize, Deserialize)]
struct ArchiveCheckpoint {
    stream: StreamState,
    cursor: ZipCursor,
    inflate: Option<InflateCheckpoint>,
}

impl ArchiveReader {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
            cursor: ZipCursor::default(),
            inflater: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            verify_crc: true,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Compressed bytes of one deflated member kept for checkpoints. Pausing
    /// inside a longer member fails with
    /// [`CheckpointError::ReplayTooLarge`].
    pub fn with_replay_limit(mut self, limit: usize) -> Self {
        self.replay_limit = limit;
        self
    }

    pub fn verify_crc(mut self, yes: bool) -> Self {
        self.verify_crc = yes;
        self
    }

    pub fn cursor(&self) -> &ZipCursor {
        &self.cursor
    }

    fn consume(&mut self, n: usize) -> Bytes {
        self.cursor.bytes_parsed += n as u64;
        self.state.input.split_to(n).freeze()
    }

    fn step(&mut self) -> Result<Step, ZipError> {
        match self.cursor.phase {
            ZipPhase::Scan => self.scan(),
            ZipPhase::FileEntry if self.cursor.header.is_none() => self.file_header(),
            ZipPhase::FileEntry => self.file_data(),
            ZipPhase::DataDescriptor => self.data_descriptor(),
            ZipPhase::CentralDirEntry => {
                let Some(len) = CentralDirectoryHeader::record_len(&self.state.input) else {
                    return Ok(Step::NeedInput);
                };
                if self.state.input.len() < len {
                    return Ok(Step::NeedInput);
                }
                self.consume(len);
                self.cursor.phase = ZipPhase::Scan;
                Ok(Step::Continue)
            }
            ZipPhase::EndCentralDirEntry => {
                let Some(eocd) = EndOfCentralDirectory::parse(&self.state.input) else {
                    return Ok(Step::NeedInput);
                };
                if eocd.is_zip64() {
                    return Err(ZipError::Zip64Unsupported {
                        context: "end of central directory".into(),
                    });
                }
                if eocd.is_multi_disk() {
                    return Err(ZipError::MultiDisk);
                }
                if self.state.input.len() < eocd.record_len() {
                    return Ok(Step::NeedInput);
                }
                self.consume(eocd.record_len());
                tracing::debug!(
                    entries = eocd.total_entries,
                    offset = self.cursor.bytes_parsed,
                    "end of archive"
                );
                self.cursor.phase = ZipPhase::Complete;
                Ok(Step::Continue)
            }
            ZipPhase::Complete => {
                self.state.input.clear();
                Ok(Step::Done)
            }
            ZipPhase::Error => Ok(Step::Done),
        }
    }

    fn scan(&mut self) -> Result<Step, ZipError> {
        if self.state.input.len() < 4 {
            return Ok(Step::NeedInput);
        }
        let raw = u32::from_le_bytes([
            self.state.input[0],
            self.state.input[1],
            self.state.input[2],
            self.state.input[3],
        ]);
        let next = match Signature::from_u32(raw) {
            Signature::LocalFile => ZipPhase::FileEntry,
            Signature::CentralDirectory => ZipPhase::CentralDirEntry,
            Signature::EndOfCentralDirectory => ZipPhase::EndCentralDirEntry,
            Signature::Zip64EndOfCentralDirectory | Signature::Zip64Locator => {
                return Err(ZipError::Zip64Unsupported {
                    context: format!("record at offset {}", self.cursor.bytes_parsed),
                });
            }
            Signature::Unknown(signature) => {
                return Err(ZipError::InvalidSignature {
                    signature,
                    offset: self.cursor.bytes_parsed,
                });
            }
        };
        self.consume(4);
        self.cursor.phase = next;
        Ok(Step::Continue)
    }

    fn file_header(&mut self) -> Result<Step, ZipError> {
        let Some((header, len)) = LocalFileHeader::parse(&self.state.input) else {
            return Ok(Step::NeedInput);
        };
        let path = header.path.clone();
        if header.is_encrypted() {
            return Err(ZipError::Encrypted { path });
        }
        if header.is_zip64() {
            return Err(ZipError::Zip64Unsupported {
                context: format!("sizes of {path}"),
            });
        }
        self.inflater = match header.compression_method {
            CompressionMethod::Stored => {
                if header.is_unsized() && !header.is_directory() {
                    return Err(ZipError::StreamingEntry { path });
                }
                None
            }
            CompressionMethod::Deflate => {
                Some(Inflater::raw().with_replay_limit(self.replay_limit))
            }
            CompressionMethod::Unknown(method) => {
                return Err(ZipError::UnsupportedMethod { method, path });
            }
        };
        self.consume(len);

        tracing::debug!(
            path = %header.path,
            method = header.compression_method.as_u16(),
            size = header.compressed_size,
            modified = %header.modified(),
            offset = self.cursor.bytes_parsed,
            "archive member"
        );
        self.cursor.header = Some(header);
        self.cursor.member_consumed = 0;
        self.cursor.member_produced = 0;
        self.cursor.crc = 0;
        self.cursor.skipping = false;
        self.cursor.entries_seen += 1;
        Ok(Step::Continue)
    }

    fn file_data(&mut self) -> Result<Step, ZipError> {
        let Some(header) = self.cursor.header.as_ref() else {
            return Ok(Step::Continue);
        };
        let sized = !header.is_unsized() || header.compression_method == CompressionMethod::Stored;
        let size = u64::from(header.compressed_size);
        let path = header.path.clone();
        let stream_ended = self.inflater.as_ref().is_some_and(Inflater::is_finished);

        if (sized && self.cursor.member_consumed == size) || (!sized && stream_ended) {
            return self.finish_member();
        }
        if self.state.input.is_empty() {
            return Ok(Step::NeedInput);
        }

        let mut take = self.state.input.len().min(self.chunk_size);
        if sized {
            take = take.min((size - self.cursor.member_consumed) as usize);
        }

        if self.cursor.skipping && sized {
            self.consume(take);
            self.cursor.member_consumed += take as u64;
            return Ok(Step::Continue);
        }
        if self.inflater.is_none() {
            let data = self.consume(take);
            self.cursor.member_consumed += take as u64;
            return Ok(self.deliver(data));
        }

        let Some(inflater) = self.inflater.as_mut() else {
            return Ok(Step::Continue);
        };
        let (consumed, output) =
            inflater
                .inflate(&self.state.input[..take])
                .map_err(|message| ZipError::Inflate {
                    path: path.clone(),
                    message,
                })?;
        let finished = inflater.is_finished();
        self.consume(consumed);
        self.cursor.member_consumed += consumed as u64;

        if finished && sized && self.cursor.member_consumed < size {
            return Err(ZipError::Inflate {
                path,
                message: "deflate stream ended before the compressed size".into(),
            });
        }
        if !output.is_empty() {
            return Ok(self.deliver(Bytes::from(output)));
        }
        if consumed == 0 && !finished {
            return Ok(Step::NeedInput);
        }
        Ok(Step::Continue)
    }

    /// Accounts for decoded member bytes and hands them out unless the
    /// member is being skipped.
    fn deliver(&mut self, data: Bytes) -> Step {
        self.cursor.member_produced += data.len() as u64;
        if self.cursor.skipping {
            return Step::Continue;
        }
        if self.verify_crc {
            let mut hasher = Hasher::new_with_initial(self.cursor.crc);
            hasher.update(&data);
            self.cursor.crc = hasher.finalize();
        }
        Step::Emit(data)
    }

    fn finish_member(&mut self) -> Result<Step, ZipError> {
        let Some(header) = self.cursor.header.as_ref() else {
            self.cursor.phase = ZipPhase::Scan;
            return Ok(Step::Continue);
        };
        let unfinished = self
            .inflater
            .as_ref()
            .is_some_and(|inflater| !inflater.is_finished());
        if unfinished && !self.cursor.skipping {
            return Err(ZipError::Inflate {
                path: header.path.clone(),
                message: "deflate stream is incomplete".into(),
            });
        }
        self.inflater = None;

        if header.has_data_descriptor() {
            self.cursor.phase = ZipPhase::DataDescriptor;
            return Ok(Step::Continue);
        }
        self.check_crc(header.crc32)?;
        self.end_member();
        Ok(Step::Continue)
    }

    fn data_descriptor(&mut self) -> Result<Step, ZipError> {
        let Some((descriptor, len)) = DataDescriptor::parse(&self.state.input) else {
            return Ok(Step::NeedInput);
        };
        self.consume(len);
        self.check_crc(descriptor.crc32)?;
        self.end_member();
        Ok(Step::Continue)
    }

    fn check_crc(&self, expected: u32) -> Result<(), ZipError> {
        let Some(header) = self.cursor.header.as_ref() else {
            return Ok(());
        };
        if !self.verify_crc || self.cursor.skipping || header.is_directory() {
            return Ok(());
        }
        if self.cursor.crc != expected {
            return Err(ZipError::CrcMismatch {
                path: header.path.clone(),
                expected,
                actual: self.cursor.crc,
            });
        }
        Ok(())
    }

    fn end_member(&mut self) {
        if let Some(header) = self.cursor.header.take() {
            tracing::trace!(
                path = %header.path,
                produced = self.cursor.member_produced,
                skipped = self.cursor.skipping,
                "member done"
            );
        }
        self.cursor.skipping = false;
        self.cursor.phase = ZipPhase::Scan;
    }
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for ArchiveReader {
    fn state(&self) -> &StreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    fn produce_next(&mut self, _ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        self.cursor.paused_at_incomplete_input = false;
        loop {
            match self.step() {
                Ok(Step::Emit(data)) => {
                    let path = self
                        .cursor
                        .header
                        .as_ref()
                        .map(|header| header.path.clone())
                        .unwrap_or_default();
                    self.state.emit(data, &path);
                    return true;
                }
                Ok(Step::Continue) => {}
                Ok(Step::NeedInput) => {
                    if !self.state.input_eof {
                        self.cursor.paused_at_incomplete_input = true;
                        return false;
                    }
                    if self.cursor.phase == ZipPhase::Scan && self.state.input.is_empty() {
                        self.state.finish();
                        return false;
                    }
                    let error = ZipError::Truncated {
                        offset: self.cursor.bytes_parsed,
                    };
                    self.cursor.phase = ZipPhase::Error;
                    self.state.fail(error.to_string());
                    return true;
                }
                Ok(Step::Done) => {
                    self.state.finish();
                    return false;
                }
                Err(error) => {
                    tracing::warn!(offset = self.cursor.bytes_parsed, "{error}");
                    self.cursor.phase = ZipPhase::Error;
                    self.inflater = None;
                    self.state.fail(error.to_string());
                    return true;
                }
            }
        }
    }

    fn skip_current_file(&mut self) {
        if self.cursor.phase != ZipPhase::FileEntry {
            return;
        }
        if let Some(header) = &self.cursor.header {
            tracing::debug!(path = %header.path, "skipping archive member");
            self.cursor.skipping = true;
            if !header.is_unsized() {
                // The size is known, so the rest need not be decoded at all.
                self.inflater = None;
            }
        }
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&ArchiveCheckpoint {
            stream: self.state.clone(),
            cursor: self.cursor.clone(),
            inflate: self.inflater.as_ref().map(Inflater::checkpoint).transpose()?,
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: ArchiveCheckpoint = checkpoint::load(state)?;
        self.inflater = match saved.inflate {
            Some(inflate) => Some(Inflater::restore(inflate).map_err(CheckpointError::Invalid)?),
            None => None,
        };
        self.state = saved.stream;
        self.cursor = saved.cursor;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Chunk, InputContext};
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use std::io::Write;

    struct Member<'a> {
        path: &'a str,
        data: &'a [u8],
        deflate: bool,
        descriptor: bool,
    }

    fn member<'a>(path: &'a str, data: &'a [u8], deflate: bool) -> Member<'a> {
        Member {
            path,
            data,
            deflate,
            descriptor: false,
        }
    }

    fn archive(members: &[Member<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for m in members {
            let body = if m.deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(m.data).unwrap();
                encoder.finish().unwrap()
            } else {
                m.data.to_vec()
            };
            let crc = crc32fast::hash(m.data);
            let (flags, hcrc, csize, usize_) = if m.descriptor {
                (0x0008u16, 0, 0, 0)
            } else {
                (0, crc, body.len() as u32, m.data.len() as u32)
            };
            out.extend_from_slice(&Signature::LOCAL_FILE.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&(if m.deflate { 8u16 } else { 0 }).to_le_bytes());
            out.extend_from_slice(&[0; 4]);
            out.extend_from_slice(&hcrc.to_le_bytes());
            out.extend_from_slice(&csize.to_le_bytes());
            out.extend_from_slice(&usize_.to_le_bytes());
            out.extend_from_slice(&(m.path.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(m.path.as_bytes());
            out.extend_from_slice(&body);
            if m.descriptor {
                out.extend_from_slice(&Signature::DATA_DESCRIPTOR.to_le_bytes());
                out.extend_from_slice(&crc.to_le_bytes());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&(m.data.len() as u32).to_le_bytes());
            }

            central.extend_from_slice(&Signature::CENTRAL_DIRECTORY.to_le_bytes());
            let mut fixed = [0u8; CentralDirectoryHeader::FIXED_SIZE];
            fixed[24..26].copy_from_slice(&(m.path.len() as u16).to_le_bytes());
            central.extend_from_slice(&fixed);
            central.extend_from_slice(m.path.as_bytes());
        }
        out.extend_from_slice(&central);
        out.extend_from_slice(&Signature::END_OF_CENTRAL_DIRECTORY.to_le_bytes());
        let mut eocd = [0u8; EndOfCentralDirectory::FIXED_SIZE];
        eocd[6..8].copy_from_slice(&(members.len() as u16).to_le_bytes());
        out.extend_from_slice(&eocd);
        out
    }

    /// Feeds `bytes` in pieces and collects `(file_id, data)` plus errors.
    fn run(reader: &mut ArchiveReader, bytes: &[u8], piece: usize) -> (Vec<(String, Vec<u8>)>, Vec<String>) {
        let mut ctx = PipelineContext::detached();
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut errors = Vec::new();
        let mut collect = |reader: &mut ArchiveReader, ctx: &mut PipelineContext<'_>| {
            while reader.produce_next(ctx) {
                match reader.output() {
                    Some(Chunk::Data(data)) => match files.last_mut() {
                        Some((id, buf)) if *id == reader.file_id() => buf.extend_from_slice(data),
                        _ => files.push((reader.file_id().to_string(), data.to_vec())),
                    },
                    Some(Chunk::Error(message)) => errors.push(message.clone()),
                    None => {}
                }
            }
        };
        for chunk in bytes.chunks(piece.max(1)) {
            reader.append_input(chunk, &InputContext::default());
            collect(reader, &mut ctx);
        }
        reader.signal_input_eof();
        collect(reader, &mut ctx);
        (files, errors)
    }

    #[test]
    fn decodes_stored_and_deflated_members() {
        let zip = archive(&[
            member("readme.txt", b"plain bytes", false),
            member("export.wxr", b"<rss><channel>hello hello hello</channel></rss>", true),
        ]);
        let mut reader = ArchiveReader::new();
        let (files, errors) = run(&mut reader, &zip, zip.len());
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(files[0], ("readme.txt".into(), b"plain bytes".to_vec()));
        assert_eq!(files[1].0, "export.wxr");
        assert_eq!(files[1].1, b"<rss><channel>hello hello hello</channel></rss>");
        assert!(reader.is_output_exhausted());
        assert_eq!(reader.cursor().phase, ZipPhase::Complete);
        assert_eq!(reader.cursor().bytes_parsed, zip.len() as u64);
        assert_eq!(reader.cursor().entries_seen, 2);
    }

    #[test]
    fn incomplete_input_is_not_an_error() {
        let zip = archive(&[member("a.txt", b"abc", false)]);
        let mut reader = ArchiveReader::new();
        reader.append_input(&zip[..10], &InputContext::default());
        assert!(!reader.produce_next(&mut PipelineContext::detached()));
        assert!(reader.cursor().paused_at_incomplete_input);
        assert!(reader.last_error().is_none());
        assert!(!reader.is_output_exhausted());
    }

    #[test]
    fn truncated_archive_fails_at_eof() {
        let zip = archive(&[member("a.txt", b"abcdef", false)]);
        let mut reader = ArchiveReader::new();
        let (_, errors) = run(&mut reader, &zip[..40], 40);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("truncated archive"), "{errors:?}");
    }

    #[test]
    fn bad_signature_names_signature_and_offset() {
        let mut zip = archive(&[member("a.txt", b"abc", false)]);
        let offset = 30 + "a.txt".len() + 3;
        zip[offset..offset + 4].copy_from_slice(b"JUNK");
        let mut reader = ArchiveReader::new();
        let (files, errors) = run(&mut reader, &zip, 7);
        assert_eq!(files, vec![("a.txt".to_string(), b"abc".to_vec())]);
        assert_eq!(
            errors,
            vec![format!("invalid signature 0x4b4e554a at offset {offset}")]
        );
        assert_eq!(reader.cursor().phase, ZipPhase::Error);
        assert!(reader.is_output_exhausted());
    }

    #[test]
    fn rejects_zip64_sizes() {
        let mut zip = archive(&[member("big.bin", b"x", false)]);
        zip[18..22].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let (_, errors) = run(&mut ArchiveReader::new(), &zip, zip.len());
        assert!(errors[0].contains("ZIP64"), "{errors:?}");
    }

    #[test]
    fn data_descriptor_members_decode_to_end_of_stream() {
        let mut streamed = member("stream.xml", b"<a>streamed streamed streamed</a>", true);
        streamed.descriptor = true;
        let zip = archive(&[streamed, member("after.txt", b"next", false)]);
        for piece in [1, 5, zip.len()] {
            let (files, errors) = run(&mut ArchiveReader::new(), &zip, piece);
            assert!(errors.is_empty(), "{errors:?}");
            assert_eq!(files[0].1, b"<a>streamed streamed streamed</a>");
            assert_eq!(files[1], ("after.txt".into(), b"next".to_vec()));
        }
    }

    #[test]
    fn detects_crc_mismatch() {
        let mut zip = archive(&[member("a.txt", b"abc", false)]);
        zip[14] ^= 0xFF;
        let (_, errors) = run(&mut ArchiveReader::new(), &zip, zip.len());
        assert!(errors[0].starts_with("CRC mismatch for a.txt"), "{errors:?}");

        let (files, errors) = run(&mut ArchiveReader::new().verify_crc(false), &zip, zip.len());
        assert!(errors.is_empty());
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn skip_drops_rest_of_member() {
        let zip = archive(&[
            member("a.txt", b"aaaaaaaaaaaaaaaaaaaa", false),
            member("b.txt", b"bbbb", true),
        ]);
        let mut reader = ArchiveReader::new().with_chunk_size(4);
        let mut ctx = PipelineContext::detached();
        reader.append_input(&zip, &InputContext::default());
        reader.signal_input_eof();

        assert!(reader.produce_next(&mut ctx));
        assert_eq!(reader.file_id(), "a.txt");
        reader.skip_current_file();

        let mut rest: Vec<(String, Vec<u8>)> = Vec::new();
        while reader.produce_next(&mut ctx) {
            match reader.output() {
                Some(Chunk::Data(data)) => match rest.last_mut() {
                    Some((id, buf)) if *id == reader.file_id() => buf.extend_from_slice(data),
                    _ => rest.push((reader.file_id().to_string(), data.to_vec())),
                },
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(rest, vec![("b.txt".to_string(), b"bbbb".to_vec())]);
        assert!(reader.is_output_exhausted());
    }

    #[test]
    fn resumes_inside_a_deflate_member() {
        let text: &[u8] = b"<item><title>resume me</title></item><item><title>again</title></item>";
        let zip = archive(&[member("feed.xml", text, true)]);
        let split = 30 + "feed.xml".len() + 10;

        let mut first = ArchiveReader::new().with_chunk_size(3);
        let mut ctx = PipelineContext::detached();
        let mut out = Vec::new();
        first.append_input(&zip[..split], &InputContext::default());
        while first.produce_next(&mut ctx) {
            if let Some(Chunk::Data(data)) = first.output() {
                out.extend_from_slice(data);
            }
        }
        let json = serde_json::to_string(&first.pause().unwrap()).unwrap();

        let mut second = ArchiveReader::new().with_chunk_size(3);
        second.resume(serde_json::from_str(&json).unwrap()).unwrap();
        let (files, errors) = run(&mut second, &zip[split..], 11);
        assert!(errors.is_empty(), "{errors:?}");
        for (_, data) in files {
            out.extend(data);
        }
        assert_eq!(out, text);
    }
}
