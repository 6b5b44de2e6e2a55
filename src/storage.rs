use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::config::{ARCHIVE_SUFFIX, JOURNAL_SUFFIX, PARTIAL_SUFFIX};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// On-disk locations belonging to one upload target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadPaths {
    /// Storage-relative key, `principal/name` or `name` for anonymous uploads.
    pub key: String,
    pub dir: PathBuf,
    pub final_path: PathBuf,
    pub partial_path: PathBuf,
    pub journal_path: PathBuf,
}

impl UploadPaths {
    pub fn new(key: String, final_path: PathBuf) -> Self {
        let partial_path = with_suffix(&final_path, PARTIAL_SUFFIX);
        let journal_path = with_suffix(&partial_path, JOURNAL_SUFFIX);
        let dir = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            key,
            dir,
            final_path,
            partial_path,
            journal_path,
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolves the upload target `name` for `principal`.
    ///
    /// Names that use the reserved partial, journal or archive suffixes are
    /// rejected so clients cannot address engine files directly.
    pub async fn resolve_upload(
        &self,
        principal: Option<&str>,
        name: &str,
    ) -> Result<UploadPaths, StorageError> {
        let name = name.trim().trim_start_matches(['/', '\\']);
        if name.is_empty() || is_reserved_name(name) {
            return Err(StorageError::InvalidPath);
        }
        let relative = match principal {
            Some(principal) => {
                if !is_single_component(principal) {
                    return Err(StorageError::InvalidPath);
                }
                format!("{principal}/{name}")
            }
            None => name.to_string(),
        };
        let target = self.resolve_path_checked(&relative, true).await?;
        let key = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if key.is_empty() {
            return Err(StorageError::InvalidPath);
        }
        Ok(UploadPaths::new(key, target))
    }

    /// Creates the directory an upload will live in.
    pub async fn prepare_dir(&self, paths: &UploadPaths) -> Result<(), StorageError> {
        fs::create_dir_all(&paths.dir).await?;
        self.ensure_no_symlink_components(&paths.dir, false).await
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }
}

fn is_single_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_reserved_name(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
        || name.ends_with(JOURNAL_SUFFIX)
        || (name.ends_with(ARCHIVE_SUFFIX) && name.contains(JOURNAL_SUFFIX))
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
