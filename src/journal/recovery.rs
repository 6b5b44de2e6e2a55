//! 读取整个 journal，校验记录序列并重建最后可信的写入偏移量。

use std::io::Read;

use super::codec;
use super::{Action, Corruption, FileState, FormatVersion, JournalError, Record};

/// Outcome of walking a journal.
#[derive(Debug)]
pub struct Recovery {
    pub version: FormatVersion,
    /// `false` for an empty journal that was created but never written.
    pub has_header: bool,
    pub state: FileState,
    /// Journal length up to and including the last confirmed `end` record.
    /// A damaged journal is truncated back to this point during repair.
    pub trusted_len: u64,
    pub error: Option<JournalError>,
}

impl Recovery {
    fn empty() -> Self {
        Self {
            version: FormatVersion::LATEST,
            has_header: false,
            state: FileState::default(),
            trusted_len: 0,
            error: None,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.error.as_ref().is_some_and(JournalError::is_corruption)
    }
}

enum Step {
    Confirmed(u64),
    Provisional,
}

/// Walks `reader` from the start of a journal.
///
/// Corruption stops the walk and keeps the last confirmed state; it is
/// reported through [`Recovery::error`] together with the journal offset of
/// the offending record.
pub fn recover<R: Read>(mut reader: R) -> Recovery {
    let mut recovery = Recovery::empty();

    let version = match codec::read_tag(&mut reader) {
        Ok(Some(version)) => version,
        Ok(None) => return recovery,
        Err(err) => {
            recovery.error = Some(err);
            return recovery;
        }
    };
    recovery.version = version;

    let header = match codec::decode_header(version, &mut reader) {
        Ok(header) => header,
        Err(err) => {
            recovery.error = Some(err);
            return recovery;
        }
    };
    recovery.has_header = true;
    recovery.state = FileState::from_header(&header);
    recovery.trusted_len = version.header_len();

    let record_len = version.record_len();
    let mut position = recovery.trusted_len;
    let mut previous: Option<Record> = None;
    let mut buf = vec![0u8; record_len as usize];

    loop {
        let filled = match codec::fill(&mut reader, &mut buf) {
            Ok(filled) => filled,
            Err(err) => {
                recovery.error = Some(JournalError::Reading(err));
                break;
            }
        };
        if filled == 0 {
            if previous.is_some_and(|record| record.action == Action::Begin) {
                recovery.error = Some(JournalError::Corrupted {
                    kind: Corruption::DanglingBegin,
                    at: position - record_len,
                });
            }
            break;
        }
        if filled < buf.len() {
            recovery.error = Some(JournalError::Corrupted {
                kind: Corruption::TruncatedRecord,
                at: position,
            });
            break;
        }

        let step = codec::decode_record(version, &buf).and_then(|current| {
            let step = next_step(previous.as_ref(), &current, recovery.state.file_size)?;
            previous = Some(current);
            Ok(step)
        });
        match step {
            Ok(Step::Confirmed(offset)) => {
                recovery.state.start_offset = offset;
                recovery.trusted_len = position + record_len;
            }
            Ok(Step::Provisional) => {}
            Err(kind) => {
                recovery.error = Some(JournalError::Corrupted { kind, at: position });
                break;
            }
        }
        position += record_len;
    }

    recovery
}

fn next_step(previous: Option<&Record>, current: &Record, file_size: u64) -> Result<Step, Corruption> {
    if current.start_offset > file_size {
        return Err(Corruption::OffsetBeyondLength);
    }
    match (previous, current.action) {
        (Some(prev), Action::End)
            if prev.action == Action::Begin && prev.start_offset == current.start_offset =>
        {
            Ok(Step::Confirmed(current.end_offset()))
        }
        (None, Action::Begin) => Ok(Step::Provisional),
        (Some(prev), Action::Begin)
            if prev.action == Action::End && current.start_offset >= prev.start_offset =>
        {
            Ok(Step::Provisional)
        }
        (Some(prev), _) if current.start_offset < prev.start_offset => {
            Err(Corruption::DecreasingOffset)
        }
        _ => Err(Corruption::OutOfOrder),
    }
}
