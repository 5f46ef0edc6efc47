use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// Record signatures, read as little-endian `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    LocalFile,
    CentralDirectory,
    EndOfCentralDirectory,
    Zip64EndOfCentralDirectory,
    Zip64Locator,
    Unknown(u32),
}

impl Signature {
    pub const LOCAL_FILE: u32 = 0x0403_4b50;
    pub const CENTRAL_DIRECTORY: u32 = 0x0201_4b50;
    pub const END_OF_CENTRAL_DIRECTORY: u32 = 0x0605_4b50;
    pub const ZIP64_END_OF_CENTRAL_DIRECTORY: u32 = 0x0606_4b50;
    pub const ZIP64_LOCATOR: u32 = 0x0706_4b50;
    pub const DATA_DESCRIPTOR: u32 = 0x0807_4b50;

    pub fn from_u32(value: u32) -> Self {
        match value {
            Self::LOCAL_FILE => Signature::LocalFile,
            Self::CENTRAL_DIRECTORY => Signature::CentralDirectory,
            Self::END_OF_CENTRAL_DIRECTORY => Signature::EndOfCentralDirectory,
            Self::ZIP64_END_OF_CENTRAL_DIRECTORY => Signature::Zip64EndOfCentralDirectory,
            Self::ZIP64_LOCATOR => Signature::Zip64Locator,
            other => Signature::Unknown(other),
        }
    }
}

/// Size value that defers to a ZIP64 extra field.
pub const ZIP64_SENTINEL: u32 = 0xFFFF_FFFF;

/// Local File Header (LFH), without its 4-byte signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub general_purpose: u16,
    pub compression_method: CompressionMethod,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: String,
}

impl LocalFileHeader {
    pub const FIXED_SIZE: usize = 26;

    /// Parses a header from the front of `data`.
    ///
    /// Returns `None` until the fixed part, the path and the extra field are
    /// all buffered; otherwise the header and the number of bytes it spans.
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < Self::FIXED_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(data);
        let version_needed = cursor.read_u16::<LittleEndian>().ok()?;
        let general_purpose = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_method = cursor.read_u16::<LittleEndian>().ok()?;
        let last_mod_time = cursor.read_u16::<LittleEndian>().ok()?;
        let last_mod_date = cursor.read_u16::<LittleEndian>().ok()?;
        let crc32 = cursor.read_u32::<LittleEndian>().ok()?;
        let compressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        let uncompressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        let path_length = cursor.read_u16::<LittleEndian>().ok()? as usize;
        let extra_length = cursor.read_u16::<LittleEndian>().ok()? as usize;

        let total = Self::FIXED_SIZE + path_length + extra_length;
        if data.len() < total {
            return None;
        }
        // Use lossy conversion to handle non-UTF8 filenames gracefully
        let path_bytes = &data[Self::FIXED_SIZE..Self::FIXED_SIZE + path_length];
        let path = String::from_utf8_lossy(path_bytes).into_owned();

        Some((
            Self {
                version_needed,
                general_purpose,
                compression_method: CompressionMethod::from_u16(compression_method),
                last_mod_time,
                last_mod_date,
                crc32,
                compressed_size,
                uncompressed_size,
                path,
            },
            total,
        ))
    }

    pub fn is_encrypted(&self) -> bool {
        self.general_purpose & 0x0001 != 0
    }

    /// Sizes and CRC follow the data in a data descriptor (bit 3).
    pub fn has_data_descriptor(&self) -> bool {
        self.general_purpose & 0x0008 != 0
    }

    pub fn is_zip64(&self) -> bool {
        self.compressed_size == ZIP64_SENTINEL || self.uncompressed_size == ZIP64_SENTINEL
    }

    /// The member must be inflated until its end-of-stream marker because
    /// the header does not say how long it is.
    pub fn is_unsized(&self) -> bool {
        self.has_data_descriptor() && self.compressed_size == 0
    }

    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    /// DOS modification stamp as `YYYY-MM-DD HH:MM:SS`.
    pub fn modified(&self) -> String {
        let (date, time) = (self.last_mod_date, self.last_mod_time);
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            (date >> 9) + 1980,
            (date >> 5) & 0x0F,
            date & 0x1F,
            time >> 11,
            (time >> 5) & 0x3F,
            (time & 0x1F) * 2,
        )
    }
}

/// Central Directory File Header (CDFH), without its signature: 42 fixed
/// bytes followed by path, extra field and comment.
pub struct CentralDirectoryHeader;

impl CentralDirectoryHeader {
    pub const FIXED_SIZE: usize = 42;

    /// Total record length once the fixed part is buffered.
    pub fn record_len(data: &[u8]) -> Option<usize> {
        if data.len() < Self::FIXED_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(&data[24..30]);
        let path_length = cursor.read_u16::<LittleEndian>().ok()? as usize;
        let extra_length = cursor.read_u16::<LittleEndian>().ok()? as usize;
        let comment_length = cursor.read_u16::<LittleEndian>().ok()? as usize;
        Some(Self::FIXED_SIZE + path_length + extra_length + comment_length)
    }
}

/// End of Central Directory (EOCD), without its signature: 18 fixed bytes
/// followed by the archive comment.
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const FIXED_SIZE: usize = 18;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::FIXED_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(data);
        Some(Self {
            disk_number: cursor.read_u16::<LittleEndian>().ok()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>().ok()?,
            disk_entries: cursor.read_u16::<LittleEndian>().ok()?,
            total_entries: cursor.read_u16::<LittleEndian>().ok()?,
            cd_size: cursor.read_u32::<LittleEndian>().ok()?,
            cd_offset: cursor.read_u32::<LittleEndian>().ok()?,
            comment_len: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    pub fn record_len(&self) -> usize {
        Self::FIXED_SIZE + self.comment_len as usize
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == ZIP64_SENTINEL
            || self.cd_offset == ZIP64_SENTINEL
    }

    pub fn is_multi_disk(&self) -> bool {
        self.disk_number != 0 || self.disk_with_cd != 0
    }
}

/// Trailer of a member written with bit 3 set: CRC and sizes, optionally
/// preceded by its own signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

impl DataDescriptor {
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        let mut cursor = Cursor::new(data);
        let first = cursor.read_u32::<LittleEndian>().ok()?;
        let (crc32, len) = if first == Signature::DATA_DESCRIPTOR {
            (cursor.read_u32::<LittleEndian>().ok()?, 16)
        } else {
            (first, 12)
        };
        let compressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        let uncompressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        Some((
            Self {
                crc32,
                compressed_size,
                uncompressed_size,
            },
            len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_header(path: &str, extra: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0x0008u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&0x6a4fu16.to_le_bytes());
        out.extend_from_slice(&0x5a8cu16.to_le_bytes());
        out.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(extra);
        out
    }

    #[test]
    fn local_header_waits_for_variable_fields() {
        let bytes = local_header("wp/export.wxr", &[1, 2, 3, 4]);
        for cut in 0..bytes.len() {
            assert!(LocalFileHeader::parse(&bytes[..cut]).is_none(), "cut {cut}");
        }
        let (header, len) = LocalFileHeader::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(header.path, "wp/export.wxr");
        assert_eq!(header.compression_method, CompressionMethod::Deflate);
        assert_eq!(header.crc32, 0xdeadbeef);
        assert!(header.has_data_descriptor());
        assert!(header.is_unsized());
        assert!(!header.is_encrypted());
        assert_eq!(header.modified(), "2025-04-12 13:18:30");
    }

    #[test]
    fn data_descriptor_signature_is_optional() {
        let mut signed = Signature::DATA_DESCRIPTOR.to_le_bytes().to_vec();
        signed.extend_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
        let (descriptor, len) = DataDescriptor::parse(&signed).unwrap();
        assert_eq!(len, 16);
        assert_eq!(descriptor.crc32, 1);

        let (descriptor, len) = DataDescriptor::parse(&signed[4..]).unwrap();
        assert_eq!(len, 12);
        assert_eq!(descriptor.uncompressed_size, 3);

        assert!(DataDescriptor::parse(&signed[..10]).is_none());
    }

    #[test]
    fn eocd_detects_zip64_markers() {
        let mut record = vec![0u8; EndOfCentralDirectory::FIXED_SIZE];
        record[16] = 5;
        let eocd = EndOfCentralDirectory::parse(&record).unwrap();
        assert_eq!(eocd.record_len(), 23);
        assert!(!eocd.is_zip64());

        record[12..16].copy_from_slice(&ZIP64_SENTINEL.to_le_bytes());
        assert!(EndOfCentralDirectory::parse(&record).unwrap().is_zip64());
    }
}
