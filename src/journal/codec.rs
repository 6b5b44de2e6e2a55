//! Journal byte layout.
//!
//! Everything is little-endian:
//!
//! ```text
//! tag      u32                      1 | 2
//! header   v1: expected_length i64
//!          v2: expected_length i64, content_hash [u8; 20]
//! record   v1: action u8, start_offset i64, count i64
//!          v2: action u8, start_offset i64, count i64, crc u32
//! ```
//!
//! An all-zero v2 content hash means "no hash".

use std::io::{self, Read, Write};

use super::{
    Action, CONTENT_HASH_LEN, ContentHash, Corruption, FormatVersion, Header, JournalError, Record,
};

/// Header as laid out by a specific format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionedHeader {
    V1 { expected_length: i64 },
    V2 {
        expected_length: i64,
        content_hash: ContentHash,
    },
}

/// Record as laid out by a specific format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionedRecord {
    V1 {
        action: u8,
        start_offset: i64,
        count: i64,
    },
    V2 {
        action: u8,
        start_offset: i64,
        count: i64,
        crc: u32,
    },
}

impl VersionedHeader {
    pub fn from_header(version: FormatVersion, header: &Header) -> Self {
        let expected_length = to_wire(header.expected_length);
        match version {
            FormatVersion::V1 => VersionedHeader::V1 { expected_length },
            FormatVersion::V2 => VersionedHeader::V2 {
                expected_length,
                content_hash: header.content_hash.unwrap_or([0; CONTENT_HASH_LEN]),
            },
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            VersionedHeader::V1 { expected_length } => {
                writer.write_all(&expected_length.to_le_bytes())
            }
            VersionedHeader::V2 {
                expected_length,
                content_hash,
            } => {
                writer.write_all(&expected_length.to_le_bytes())?;
                writer.write_all(content_hash)
            }
        }
    }

    pub fn read_from<R: Read>(version: FormatVersion, reader: &mut R) -> io::Result<Self> {
        let expected_length = read_i64(reader)?;
        match version {
            FormatVersion::V1 => Ok(VersionedHeader::V1 { expected_length }),
            FormatVersion::V2 => {
                let mut content_hash = [0; CONTENT_HASH_LEN];
                reader.read_exact(&mut content_hash)?;
                Ok(VersionedHeader::V2 {
                    expected_length,
                    content_hash,
                })
            }
        }
    }

    pub fn into_header(self) -> io::Result<Header> {
        let (expected_length, content_hash) = match self {
            VersionedHeader::V1 { expected_length } => (expected_length, None),
            VersionedHeader::V2 {
                expected_length,
                content_hash,
            } => (
                expected_length,
                Some(content_hash).filter(|hash| hash.iter().any(|byte| *byte != 0)),
            ),
        };
        let expected_length = u64::try_from(expected_length).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "negative expected length")
        })?;
        Ok(Header {
            expected_length,
            content_hash,
        })
    }
}

impl VersionedRecord {
    pub fn from_record(version: FormatVersion, record: &Record) -> Self {
        let action = record.action.tag();
        let start_offset = to_wire(record.start_offset);
        let count = to_wire(record.count);
        match version {
            FormatVersion::V1 => VersionedRecord::V1 {
                action,
                start_offset,
                count,
            },
            FormatVersion::V2 => VersionedRecord::V2 {
                action,
                start_offset,
                count,
                crc: record.crc.unwrap_or(0),
            },
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            VersionedRecord::V1 {
                action,
                start_offset,
                count,
            } => {
                writer.write_all(&[*action])?;
                writer.write_all(&start_offset.to_le_bytes())?;
                writer.write_all(&count.to_le_bytes())
            }
            VersionedRecord::V2 {
                action,
                start_offset,
                count,
                crc,
            } => {
                writer.write_all(&[*action])?;
                writer.write_all(&start_offset.to_le_bytes())?;
                writer.write_all(&count.to_le_bytes())?;
                writer.write_all(&crc.to_le_bytes())
            }
        }
    }

    /// Decodes exactly one record from `bytes`, which must be
    /// `version.record_len()` long.
    pub fn parse(version: FormatVersion, bytes: &[u8]) -> Result<Self, Corruption> {
        if bytes.len() as u64 != version.record_len() {
            return Err(Corruption::TruncatedRecord);
        }
        let action = bytes[0];
        let start_offset = le_i64(&bytes[1..9]);
        let count = le_i64(&bytes[9..17]);
        Ok(match version {
            FormatVersion::V1 => VersionedRecord::V1 {
                action,
                start_offset,
                count,
            },
            FormatVersion::V2 => VersionedRecord::V2 {
                action,
                start_offset,
                count,
                crc: u32::from_le_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]),
            },
        })
    }

    pub fn into_record(self) -> Result<Record, Corruption> {
        let (action, start_offset, count, crc) = match self {
            VersionedRecord::V1 {
                action,
                start_offset,
                count,
            } => (action, start_offset, count, None),
            VersionedRecord::V2 {
                action,
                start_offset,
                count,
                crc,
            } => (action, start_offset, count, Some(crc)),
        };
        let action = Action::from_tag(action).ok_or(Corruption::UnknownAction(action))?;
        let start_offset = u64::try_from(start_offset).map_err(|_| Corruption::NegativeField)?;
        let count = u64::try_from(count).map_err(|_| Corruption::NegativeField)?;
        Ok(Record {
            action,
            start_offset,
            count,
            crc,
        })
    }
}

/// Version tag plus header.
pub fn encode_header(version: FormatVersion, header: &Header) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(version.header_len() as usize);
    bytes.extend_from_slice(&version.tag().to_le_bytes());
    // Writing into a Vec cannot fail.
    let _ = VersionedHeader::from_header(version, header).write_to(&mut bytes);
    bytes
}

pub fn encode_record(version: FormatVersion, record: &Record) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(version.record_len() as usize);
    let _ = VersionedRecord::from_record(version, record).write_to(&mut bytes);
    bytes
}

/// Reads the leading version tag. An empty stream is a journal that has not
/// been written yet and reports [`FormatVersion::LATEST`].
pub fn decode_version<R: Read>(reader: &mut R) -> Result<FormatVersion, JournalError> {
    Ok(read_tag(reader)?.unwrap_or(FormatVersion::LATEST))
}

/// Like [`decode_version`] but distinguishes the empty stream.
pub fn read_tag<R: Read>(reader: &mut R) -> Result<Option<FormatVersion>, JournalError> {
    let mut tag = [0u8; 4];
    match fill(reader, &mut tag).map_err(JournalError::Reading)? {
        0 => Ok(None),
        4 => FormatVersion::from_tag(u32::from_le_bytes(tag)).map(Some),
        _ => Err(JournalError::HeaderRead(io::Error::from(
            io::ErrorKind::UnexpectedEof,
        ))),
    }
}

/// Reads the header that follows a tag of `version`.
pub fn decode_header<R: Read>(version: FormatVersion, reader: &mut R) -> Result<Header, JournalError> {
    VersionedHeader::read_from(version, reader)
        .and_then(VersionedHeader::into_header)
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                JournalError::HeaderRead(err)
            }
            _ => JournalError::Reading(err),
        })
}

pub fn decode_record(version: FormatVersion, bytes: &[u8]) -> Result<Record, Corruption> {
    VersionedRecord::parse(version, bytes)?.into_record()
}

/// Reads until `buf` is full or the stream ends, returning the bytes read.
pub fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

fn le_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn to_wire(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
