//! 上传写前日志（journal）：格式版本、通用记录表示与错误分类。
//!
//! 每个进行中的上传都有一个 journal 文件，布局为版本标签、固定长度的头部
//! 以及一串固定长度的记录。每个 hunk 写入前追加 `begin`，写入成功后追加
//! `end`，恢复时据此推导出可信偏移量。

pub mod codec;
pub mod recovery;

use std::io;

pub use recovery::{Recovery, recover};

/// SHA-1 content hash carried by version 2 headers.
pub const CONTENT_HASH_LEN: usize = 20;
pub type ContentHash = [u8; CONTENT_HASH_LEN];

const TAG_LEN: u64 = 4;

/// On-disk journal format versions, oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    /// No record checksum, no content hash.
    V1 = 1,
    V2 = 2,
}

impl FormatVersion {
    pub const LATEST: FormatVersion = FormatVersion::V2;
    pub const SUPPORTED: [FormatVersion; 2] = [FormatVersion::V1, FormatVersion::V2];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Result<Self, JournalError> {
        match tag {
            1 => Ok(FormatVersion::V1),
            2 => Ok(FormatVersion::V2),
            other => Err(JournalError::UnsupportedVersion(other)),
        }
    }

    /// Length of the version tag plus header.
    pub fn header_len(self) -> u64 {
        TAG_LEN
            + match self {
                FormatVersion::V1 => 8,
                FormatVersion::V2 => 8 + CONTENT_HASH_LEN as u64,
            }
    }

    pub fn record_len(self) -> u64 {
        match self {
            FormatVersion::V1 => 1 + 8 + 8,
            FormatVersion::V2 => 1 + 8 + 8 + 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Begin,
    End,
}

impl Action {
    pub fn tag(self) -> u8 {
        match self {
            Action::Begin => 1,
            Action::End => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Action::Begin),
            2 => Some(Action::End),
            _ => None,
        }
    }
}

/// Version independent journal record.
///
/// `crc` is the CRC-32 of the hunk bytes; it is dropped when encoding for
/// [`FormatVersion::V1`] and always `None` after decoding one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub action: Action,
    pub start_offset: u64,
    pub count: u64,
    pub crc: Option<u32>,
}

impl Record {
    /// Intent to write `hunk` at `start_offset`.
    pub fn begin(start_offset: u64, hunk: &[u8]) -> Self {
        Self {
            action: Action::Begin,
            start_offset,
            count: hunk.len() as u64,
            crc: Some(crc32fast::hash(hunk)),
        }
    }

    /// Confirmation that `written` landed at `start_offset`.
    pub fn end(start_offset: u64, written: &[u8]) -> Self {
        Self {
            action: Action::End,
            start_offset,
            count: written.len() as u64,
            crc: Some(crc32fast::hash(written)),
        }
    }

    /// Offset right after the bytes this record covers.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.count
    }
}

/// Version independent journal header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub expected_length: u64,
    pub content_hash: Option<ContentHash>,
}

/// Upload state reconstructed from a journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileState {
    /// Expected total length from the journal header.
    pub file_size: u64,
    pub content_hash: Option<ContentHash>,
    /// Contiguous bytes confirmed by the journal.
    pub start_offset: u64,
}

impl FileState {
    pub fn from_header(header: &Header) -> Self {
        Self {
            file_size: header.expected_length,
            content_hash: header.content_hash,
            start_offset: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.start_offset)
    }

    pub fn is_complete(&self) -> bool {
        self.start_offset >= self.file_size
    }
}

/// Structural defects found while walking the record sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("record starts past the expected file length")]
    OffsetBeyondLength,
    #[error("record offset goes backwards")]
    DecreasingOffset,
    #[error("records are out of begin/end order")]
    OutOfOrder,
    #[error("unknown record action {0}")]
    UnknownAction(u8),
    #[error("negative offset or count")]
    NegativeField,
    #[error("record truncated")]
    TruncatedRecord,
    #[error("begin record without matching end")]
    DanglingBegin,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("unsupported journal version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed journal header")]
    HeaderRead(#[source] io::Error),
    #[error("journal corrupted at byte {at}: {kind}")]
    Corrupted { kind: Corruption, at: u64 },
    #[error("failed to read journal")]
    Reading(#[source] io::Error),
}

impl JournalError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, JournalError::Corrupted { .. })
    }
}
