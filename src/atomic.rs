//! 上传完成后的收尾：提升 `.part` 为最终文件并归档 journal。

use chrono::Utc;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ARCHIVE_SUFFIX;
use crate::journal::ContentHash;
use crate::storage::UploadPaths;

/// Runs once an upload has reached its expected length.
pub trait CompletionHook: Send + Sync {
    fn on_upload_complete(&self, paths: &UploadPaths, hash: Option<&ContentHash>)
    -> io::Result<()>;
}

/// Renames `<name>.part` to `<name>`, then archives or deletes the journal.
///
/// The data file is promoted first: a crash in between leaves a completed
/// file plus a stale journal, which admission refuses without touching.
#[derive(Debug, Clone, Copy)]
pub struct PromoteAndArchive {
    pub keep_journals: bool,
}

impl CompletionHook for PromoteAndArchive {
    fn on_upload_complete(
        &self,
        paths: &UploadPaths,
        hash: Option<&ContentHash>,
    ) -> io::Result<()> {
        File::open(&paths.partial_path)?.sync_all()?;
        fs::rename(&paths.partial_path, &paths.final_path)?;
        let _ = sync_dir(&paths.dir);

        if self.keep_journals {
            let archive = archive_path(&paths.journal_path);
            fs::rename(&paths.journal_path, &archive)?;
            info!(key = paths.key, archive = ?archive, "journal archived");
        } else {
            fs::remove_file(&paths.journal_path)?;
        }
        let _ = sync_dir(&paths.dir);

        info!(
            key = paths.key,
            hash = hash.map(hex::encode).unwrap_or_default(),
            "upload promoted"
        );
        Ok(())
    }
}

fn archive_path(journal: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = journal.as_os_str().to_os_string();
    name.push(format!(".{stamp}{ARCHIVE_SUFFIX}"));
    PathBuf::from(name)
}

/// SHA-1 of a whole file.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
