//! 上传准入判定：结合实际文件大小与 journal 恢复结果决定能否写入以及从哪里续传。

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use tracing::{debug, warn};

use crate::config::HUNK_SIZE;
use crate::error::UploadError;
use crate::journal::{FileState, Recovery, recover};
use crate::storage::UploadPaths;

/// Result of an admission check. Writing may start at `state.start_offset`
/// only when `refusal` is `None`.
#[derive(Debug)]
pub struct Admission {
    pub state: FileState,
    pub refusal: Option<UploadError>,
}

impl Admission {
    fn allow(state: FileState) -> Self {
        Self {
            state,
            refusal: None,
        }
    }

    fn refuse(state: FileState, error: UploadError) -> Self {
        Self {
            state,
            refusal: Some(error),
        }
    }

    pub fn into_result(self) -> Result<FileState, UploadError> {
        match self.refusal {
            None => Ok(self.state),
            Some(error) => Err(error),
        }
    }
}

/// Decides whether the upload described by `paths` may proceed.
///
/// Minor journal damage (a dangling or torn record within one hunk of the
/// data file) is repaired in place by truncating both files back to the
/// last confirmed offset.
pub fn admit_upload(paths: &UploadPaths) -> Admission {
    match exists(&paths.final_path) {
        Ok(true) => return Admission::refuse(FileState::default(), UploadError::AlreadyComplete),
        Ok(false) => {}
        Err(err) => return Admission::refuse(FileState::default(), err.into()),
    }

    let actual = match fs::metadata(&paths.partial_path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Admission::allow(FileState::default());
        }
        Err(err) => return Admission::refuse(FileState::default(), err.into()),
    };

    let journal = match File::open(&paths.journal_path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(key = paths.key, "in-progress file has no journal");
            return Admission::refuse(
                FileState::default(),
                UploadError::Forbidden {
                    reason: "in-progress file has no journal",
                    source: None,
                },
            );
        }
        Err(err) => return Admission::refuse(FileState::default(), err.into()),
    };
    let recovery = recover(BufReader::new(journal));
    if recovery.is_corrupted() {
        return repair(paths, recovery, actual);
    }

    match recovery.error {
        None => check_sizes(paths, &recovery, actual),
        Some(error) => {
            warn!(key = paths.key, error = %error, "journal unreadable");
            Admission::refuse(
                recovery.state,
                UploadError::Forbidden {
                    reason: "journal unreadable",
                    source: Some(error),
                },
            )
        }
    }
}

fn check_sizes(paths: &UploadPaths, recovery: &Recovery, actual: u64) -> Admission {
    let state = recovery.state;
    if !recovery.has_header {
        // Journal created but never written: only an empty data file fits.
        if actual == 0 {
            return Admission::allow(state);
        }
        warn!(key = paths.key, actual, "data written without journal header");
        return Admission::refuse(state, UploadError::Corrupted(None));
    }

    let trusted = state.start_offset;
    if trusted > state.file_size {
        warn!(
            key = paths.key,
            trusted,
            file_size = state.file_size,
            "journal confirms more bytes than expected"
        );
        Admission::refuse(state, UploadError::Corrupted(None))
    } else if actual == trusted && trusted == state.file_size {
        Admission::refuse(state, UploadError::AlreadyCompleteButJournalExists)
    } else if actual == trusted {
        debug!(
            key = paths.key,
            offset = trusted,
            version = ?recovery.version,
            "upload may continue"
        );
        Admission::allow(state)
    } else if actual > trusted {
        warn!(key = paths.key, actual, trusted, "data file ahead of journal");
        Admission::refuse(state, UploadError::Corrupted(None))
    } else {
        warn!(key = paths.key, actual, trusted, "data file behind journal");
        Admission::refuse(state, UploadError::ActualFileNeedsRepair)
    }
}

fn repair(paths: &UploadPaths, recovery: Recovery, actual: u64) -> Admission {
    let state = recovery.state;
    let trusted = state.start_offset;
    let repairable = actual >= trusted
        && actual - trusted <= HUNK_SIZE as u64
        && actual <= state.file_size;
    if !repairable {
        warn!(
            key = paths.key,
            actual,
            trusted,
            error = ?recovery.error,
            "journal corrupted beyond repair"
        );
        return Admission::refuse(state, UploadError::Corrupted(recovery.error));
    }

    if let Err(err) = truncate(&paths.journal_path, recovery.trusted_len) {
        return Admission::refuse(state, err.into());
    }
    if actual > trusted
        && let Err(err) = truncate(&paths.partial_path, trusted)
    {
        return Admission::refuse(state, err.into());
    }
    warn!(
        key = paths.key,
        journal_len = recovery.trusted_len,
        dropped = actual - trusted,
        offset = trusted,
        error = ?recovery.error,
        "repaired journal"
    );
    check_sizes(paths, &recovery, trusted)
}

fn truncate(path: &std::path::Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

fn exists(path: &std::path::Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::codec::{encode_header, encode_record};
    use crate::journal::{FormatVersion, Header, JournalError, Record};
    use std::path::Path;
    use tempfile::tempdir;

    fn paths_in(dir: &Path) -> UploadPaths {
        UploadPaths::new("file.bin".to_string(), dir.join("file.bin"))
    }

    fn write_journal(paths: &UploadPaths, expected_length: u64, records: &[Record]) -> u64 {
        let mut bytes = encode_header(
            FormatVersion::V2,
            &Header {
                expected_length,
                content_hash: None,
            },
        );
        for record in records {
            bytes.extend(encode_record(FormatVersion::V2, record));
        }
        std::fs::write(&paths.journal_path, &bytes).expect("write journal");
        bytes.len() as u64
    }

    fn pair(start: u64, len: usize) -> [Record; 2] {
        let data = vec![0u8; len];
        [Record::begin(start, &data), Record::end(start, &data)]
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).expect("metadata").len()
    }

    #[test]
    fn fresh_upload_starts_at_zero() {
        let temp = tempdir().expect("tempdir");
        let admission = admit_upload(&paths_in(temp.path()));
        assert!(admission.refusal.is_none());
        assert_eq!(admission.state, FileState::default());
    }

    #[test]
    fn confirmed_pair_continues_at_trusted_offset() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        write_journal(&paths, 2000, &pair(0, 1000));
        std::fs::write(&paths.partial_path, vec![1u8; 1000]).expect("write part");

        let state = admit_upload(&paths).into_result().expect("admitted");
        assert_eq!(state.start_offset, 1000);
        assert_eq!(state.file_size, 2000);
    }

    #[test]
    fn finished_file_with_journal_is_refused() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        write_journal(&paths, 1000, &pair(0, 1000));
        std::fs::write(&paths.partial_path, vec![1u8; 1000]).expect("write part");

        let admission = admit_upload(&paths);
        assert_eq!(admission.state.start_offset, 1000);
        assert!(matches!(
            admission.refusal,
            Some(UploadError::AlreadyCompleteButJournalExists)
        ));
        assert!(paths.journal_path.exists(), "journal is left in place");
    }

    #[test]
    fn completed_final_file_is_refused() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        std::fs::write(&paths.final_path, b"done").expect("write final");
        assert!(matches!(
            admit_upload(&paths).refusal,
            Some(UploadError::AlreadyComplete)
        ));
    }

    #[test]
    fn part_without_journal_is_forbidden() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        std::fs::write(&paths.partial_path, b"abc").expect("write part");
        assert!(matches!(
            admit_upload(&paths).refusal,
            Some(UploadError::Forbidden { source: None, .. })
        ));
    }

    #[test]
    fn unsupported_journal_is_forbidden() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        std::fs::write(&paths.partial_path, b"abc").expect("write part");
        std::fs::write(&paths.journal_path, 42u32.to_le_bytes()).expect("write journal");
        assert!(matches!(
            admit_upload(&paths).refusal,
            Some(UploadError::Forbidden {
                source: Some(JournalError::UnsupportedVersion(42)),
                ..
            })
        ));
    }

    #[test]
    fn empty_journal_with_empty_part_starts_at_zero() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        std::fs::write(&paths.partial_path, b"").expect("write part");
        std::fs::write(&paths.journal_path, b"").expect("write journal");
        let state = admit_upload(&paths).into_result().expect("admitted");
        assert_eq!(state.start_offset, 0);
    }

    #[test]
    fn dangling_begin_is_repaired() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        let mut records = pair(0, 500).to_vec();
        let good_len = write_journal(&paths, 2000, &records);
        records.push(Record::begin(500, &[0u8; 300]));
        write_journal(&paths, 2000, &records);
        std::fs::write(&paths.partial_path, vec![1u8; 500]).expect("write part");

        let state = admit_upload(&paths).into_result().expect("repaired");
        assert_eq!(state.start_offset, 500);
        assert_eq!(file_len(&paths.journal_path), good_len);
        assert_eq!(file_len(&paths.partial_path), 500);

        let again = admit_upload(&paths).into_result().expect("clean after repair");
        assert_eq!(again.start_offset, 500);
    }

    #[test]
    fn dangling_begin_with_partial_hunk_truncates_data() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        let mut records = pair(0, 500).to_vec();
        records.push(Record::begin(500, &[0u8; 300]));
        write_journal(&paths, 2000, &records);
        std::fs::write(&paths.partial_path, vec![1u8; 720]).expect("write part");

        let state = admit_upload(&paths).into_result().expect("repaired");
        assert_eq!(state.start_offset, 500);
        assert_eq!(file_len(&paths.partial_path), 500);
    }

    #[test]
    fn divergence_beyond_one_hunk_is_corrupted() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        let expected = 4 * HUNK_SIZE as u64;
        let mut records = pair(0, 10).to_vec();
        records.push(Record::begin(10, &[0u8; 10]));
        let original_len = write_journal(&paths, expected, &records);
        let part = std::fs::File::create(&paths.partial_path).expect("create part");
        part.set_len(10 + HUNK_SIZE as u64 + 1).expect("grow part");

        let admission = admit_upload(&paths);
        assert!(matches!(
            admission.refusal,
            Some(UploadError::Corrupted(Some(_)))
        ));
        assert_eq!(file_len(&paths.journal_path), original_len, "nothing repaired");
    }

    #[test]
    fn data_behind_corrupted_journal_is_not_repaired() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        let mut records = pair(0, 500).to_vec();
        records.push(Record::begin(500, &[0u8; 10]));
        write_journal(&paths, 1000, &records);
        std::fs::write(&paths.partial_path, vec![1u8; 100]).expect("write part");
        assert!(matches!(
            admit_upload(&paths).refusal,
            Some(UploadError::Corrupted(_))
        ));
    }

    #[test]
    fn data_ahead_of_clean_journal_is_corrupted() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        write_journal(&paths, 2000, &pair(0, 100));
        std::fs::write(&paths.partial_path, vec![1u8; 150]).expect("write part");
        assert!(matches!(
            admit_upload(&paths).refusal,
            Some(UploadError::Corrupted(None))
        ));
    }

    #[test]
    fn confirmed_bytes_past_expected_length_are_corrupted() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        write_journal(&paths, 100, &pair(0, 150));
        std::fs::write(&paths.partial_path, vec![1u8; 150]).expect("write part");

        let admission = admit_upload(&paths);
        assert_eq!(admission.state.start_offset, 150);
        assert!(matches!(
            admission.refusal,
            Some(UploadError::Corrupted(None))
        ));
        assert_eq!(file_len(&paths.partial_path), 150, "nothing truncated");
    }

    #[test]
    fn data_behind_clean_journal_needs_repair() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        write_journal(&paths, 2000, &pair(0, 100));
        std::fs::write(&paths.partial_path, vec![1u8; 50]).expect("write part");
        let admission = admit_upload(&paths);
        assert!(matches!(
            admission.refusal,
            Some(UploadError::ActualFileNeedsRepair)
        ));
    }

    #[test]
    fn admitted_offset_never_exceeds_data_file() {
        let temp = tempdir().expect("tempdir");
        let paths = paths_in(temp.path());
        let mut records = pair(0, 300).to_vec();
        records.extend(pair(300, 300));
        records.push(Record::begin(600, &[0u8; 300]));
        write_journal(&paths, 3000, &records);
        for actual in [0u64, 299, 300, 600, 650, 900] {
            let part = std::fs::File::create(&paths.partial_path).expect("create part");
            part.set_len(actual).expect("size part");
            drop(part);
            let admission = admit_upload(&paths);
            if admission.refusal.is_none() {
                assert!(admission.state.start_offset <= file_len(&paths.partial_path));
            }
        }
    }
}
