//! In-memory content store for testing.

use crate::error::{ErrorKind, Result};
use crate::key::StoreKey;
use crate::models::FileInfo;
use crate::path::ContentPath;
use crate::store::{ContentStore, FileInfoStream};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// In-memory content store for testing.
///
/// Files are stored in a map behind a [`RwLock`], so all trait methods can
/// operate on `&self` without external synchronisation. Reads can be made to
/// fail on demand with [`fail_reads_of`](Self::fail_reads_of), and every read
/// is counted, which is what most merge tests actually want to assert on.
///
/// # Examples
///
/// ```ignore
/// use depot_storage::{ContentPath, ContentStore, MemoryStore, StoreKey};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::with_files(StoreKey::hosted("local"), [
///     ("org/foo/bar/maven-metadata.xml", "<metadata/>"),
/// ]);
/// let path = ContentPath::parse("org/foo/bar/maven-metadata.xml")?;
/// assert!(store.exists(&path).await?);
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    key: StoreKey,
    storage: RwLock<BTreeMap<ContentPath, (OffsetDateTime, Vec<u8>)>>,
    failing: parking_lot::Mutex<HashSet<ContentPath>>,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new(key: StoreKey) -> Self {
        Self {
            key,
            storage: RwLock::new(BTreeMap::new()),
            failing: parking_lot::Mutex::new(HashSet::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Create a store pre-populated with files.
    ///
    /// Panics if any path fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_files(
        key: StoreKey,
        files: impl IntoIterator<Item = (impl AsRef<str>, impl Into<Vec<u8>>)>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut map = BTreeMap::new();
        for (path, data) in files {
            let Ok(validated) = ContentPath::parse(path.as_ref()) else {
                panic!("MemoryStore::with_files: invalid path {}", path.as_ref());
            };
            map.insert(validated, (now, data.into()));
        }
        Self { storage: RwLock::new(map), ..Self::new(key) }
    }

    /// Make every subsequent read of `path` fail with an I/O error.
    pub fn fail_reads_of(&self, path: &ContentPath) {
        self.failing.lock().insert(path.clone());
    }

    /// Number of `read` calls made so far, successful or not.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    fn key(&self) -> &StoreKey {
        &self.key
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a ContentPath>) -> FileInfoStream<'a> {
        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding to
            // avoid holding the lock across yield points.
            let entries: Vec<FileInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| prefix.is_none_or(|pfx| path.starts_with(pfx)))
                    .map(|(path, (modified, data))| FileInfo::new(path.clone(), data.len() as u64, *modified))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &ContentPath) -> Result<bool> {
        Ok(self.storage.read().await.contains_key(path))
    }

    async fn read(&self, path: &ContentPath) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(path) {
            let err = std::io::Error::other(format!("simulated read failure: {path}"));
            exn::bail!(ErrorKind::Io(err));
        }
        let guard = self.storage.read().await;
        let (_modified, data) = guard.get(path).ok_or_else(|| ErrorKind::NotFound(path.to_string()))?;
        Ok(data.clone())
    }

    async fn write(&self, path: &ContentPath, data: &[u8]) -> Result<()> {
        self.storage.write().await.insert(path.clone(), (OffsetDateTime::now_utc(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &ContentPath) -> Result<()> {
        self.storage
            .write()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_string())))
    }

    async fn stat(&self, path: &ContentPath) -> Result<FileInfo> {
        let guard = self.storage.read().await;
        let (modified, data) = guard.get(path).ok_or_else(|| ErrorKind::NotFound(path.to_string()))?;
        Ok(FileInfo::new(path.clone(), data.len() as u64, *modified))
    }
}
