//! Local filesystem content store.
//!
//! Files live under a configured root directory and are accessed through
//! `tokio::fs`. Used for hosted stores and for materialized group merges.

use crate::error::{ErrorKind, Result};
use crate::key::StoreKey;
use crate::models::FileInfo;
use crate::path::ContentPath;
use crate::store::{ContentStore, FileInfoStream};
use async_stream::stream;
use async_trait::async_trait;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem content store.
///
/// # Examples
///
/// ```no_run
/// use depot_storage::{LocalStore, StoreKey};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalStore::new(StoreKey::hosted("local"), "/var/lib/depot/storage")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalStore {
    key: StoreKey,
    /// Root directory for the store
    root: PathBuf,
}
impl LocalStore {
    /// Create a new local filesystem store rooted at an absolute path.
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(key: StoreKey, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let invalid = || ErrorKind::InvalidPath(root.display().to_string());
        if !root.is_absolute() {
            exn::bail!(invalid());
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(invalid());
            }
        } else {
            // Non-async: happens once on startup and isn't worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }
        Ok(Self { key, root })
    }

    fn absolute_path(&self, path: &ContentPath) -> PathBuf {
        self.root.join(path.as_str())
    }

    fn relative_path(&self, absolute: &Path) -> Result<ContentPath> {
        let relative = absolute.strip_prefix(&self.root).map_err(|_| {
            ErrorKind::BackendError(format!("path `{}` is not within root `{}`", absolute.display(), self.root.display()))
        })?;
        let relative = relative
            .to_str()
            .ok_or_else(|| ErrorKind::InvalidPath(relative.display().to_string()))?;
        ContentPath::parse(relative)
    }

    fn metadata(path: ContentPath, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        Ok(FileInfo::new(path, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Keeps the `?`-able part of the directory walk out of the stream macro,
    /// where errors have to be yielded rather than propagated.
    async fn process_entry(&self, entry: DirEntry, prefix: Option<&ContentPath>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path.display().to_string()))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if !metadata.is_file() {
            // Most likely a broken symlink.
            return Ok(WalkEntry::Skip);
        }
        let relative = self.relative_path(&path)?;
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        Ok(WalkEntry::File(Self::metadata(relative, metadata)?))
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    fn key(&self) -> &StoreKey {
        &self.key
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a ContentPath>) -> FileInfoStream<'a> {
        // Walk from the parent directory of the prefix, so a prefix whose
        // leaf is a file (or doesn't exist yet) still lists correctly.
        let start_dir = prefix
            .map(|prefix| {
                let joined = self.absolute_path(prefix);
                joined.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone())
            })
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Listing a directory that doesn't exist is an empty listing.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current.display().to_string())));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => {
                            yield Err(exn::Exn::from(Self::map_io_error(e, &current.display().to_string())));
                            continue 'entries;
                        },
                    };
                    match self.process_entry(entry, prefix).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &ContentPath) -> Result<bool> {
        Ok(fs::try_exists(self.absolute_path(path)).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &ContentPath) -> Result<Vec<u8>> {
        Ok(fs::read(self.absolute_path(path)).await.map_err(|e| Self::map_io_error(e, path.as_str()))?)
    }

    async fn write(&self, path: &ContentPath, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path);
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path.as_str()))?;
        }
        Ok(fs::write(&abs_path, data).await.map_err(|e| Self::map_io_error(e, path.as_str()))?)
    }

    async fn delete(&self, path: &ContentPath) -> Result<()> {
        Ok(fs::remove_file(self.absolute_path(path)).await.map_err(|e| Self::map_io_error(e, path.as_str()))?)
    }

    async fn stat(&self, path: &ContentPath) -> Result<FileInfo> {
        let metadata =
            fs::metadata(self.absolute_path(path)).await.map_err(|e| Self::map_io_error(e, path.as_str()))?;
        Self::metadata(path.clone(), metadata)
    }
}
