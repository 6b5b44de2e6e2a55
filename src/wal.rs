//! 写前日志写入器：按 hunk 分块追加数据，每块前后各写一条 begin/end 记录。

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};

use crate::config::HUNK_SIZE;
use crate::journal::codec::{decode_version, encode_header, encode_record};
use crate::journal::{FormatVersion, Header, Record};
use crate::storage::UploadPaths;

/// A sink whose written bytes can be forced to stable storage.
pub trait Durable: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl Durable for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Data file guarded by its journal.
///
/// Every hunk is bracketed by a `begin` record, written before the data, and
/// an `end` record carrying the number of bytes that actually landed. A
/// failed data write leaves the `begin` without its `end` so the next
/// recovery pass treats the hunk as in doubt.
#[derive(Debug)]
pub struct JournaledWriter<D, J> {
    data: D,
    journal: J,
    version: FormatVersion,
    offset: u64,
    durable: bool,
}

pub type JournaledFile = JournaledWriter<File, File>;

impl<D: Durable, J: Durable> JournaledWriter<D, J> {
    /// `data` must be positioned at `offset`; `journal` at its end.
    pub fn new(data: D, journal: J, version: FormatVersion, offset: u64, durable: bool) -> Self {
        Self {
            data,
            journal,
            version,
            offset,
            durable,
        }
    }

    /// Appends `buf` hunk by hunk.
    ///
    /// Returns the number of bytes committed (confirmed by an `end` record)
    /// and the first error, after which nothing more is written.
    pub fn append(&mut self, buf: &[u8]) -> (u64, io::Result<()>) {
        let mut committed = 0u64;
        let mut rest = buf;
        while !rest.is_empty() {
            let hunk = &rest[..rest.len().min(HUNK_SIZE)];
            match self.write_hunk(hunk) {
                Ok(written) => {
                    committed += written as u64;
                    rest = &rest[written..];
                }
                Err(err) => return (committed, Err(err)),
            }
        }
        (committed, Ok(()))
    }

    fn write_hunk(&mut self, hunk: &[u8]) -> io::Result<usize> {
        let start = self.offset;
        self.log(&Record::begin(start, hunk))?;
        if self.durable {
            self.journal.sync()?;
        }

        let written = loop {
            match self.data.write(hunk) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => break written,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        if self.durable {
            self.data.sync()?;
        }

        self.log(&Record::end(start, &hunk[..written]))?;
        self.offset += written as u64;
        Ok(written)
    }

    fn log(&mut self, record: &Record) -> io::Result<()> {
        self.journal
            .write_all(&encode_record(self.version, record))
    }

    /// Flushes and syncs both sinks, reporting the first failure.
    pub fn close(mut self) -> io::Result<()> {
        let data = self.data.flush().and_then(|_| self.data.sync());
        let journal = self.journal.flush().and_then(|_| self.journal.sync());
        data.and(journal)
    }
}

impl JournaledFile {
    /// Opens the data file and journal of `paths` to continue at `offset`.
    ///
    /// Records are appended in the format version the journal already uses.
    pub fn open(paths: &UploadPaths, offset: u64, durable: bool) -> io::Result<Self> {
        let mut journal = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&paths.journal_path)?;
        journal.seek(SeekFrom::Start(0))?;
        let version = decode_version(&mut journal).map_err(io::Error::other)?;
        journal.seek(SeekFrom::End(0))?;

        let mut data = OpenOptions::new()
            .write(true)
            .create(offset == 0)
            .truncate(false)
            .open(&paths.partial_path)?;
        data.seek(SeekFrom::Start(offset))?;
        Ok(Self::new(data, journal, version, offset, durable))
    }
}

/// Starts a fresh upload: empties the data file and writes a new journal
/// header in the latest format, replacing any stale journal.
pub fn create_journal(paths: &UploadPaths, header: &Header) -> io::Result<()> {
    let data = File::create(&paths.partial_path)?;
    data.sync_all()?;
    let mut journal = File::create(&paths.journal_path)?;
    journal.write_all(&encode_header(FormatVersion::LATEST, header))?;
    journal.sync_all()
}
