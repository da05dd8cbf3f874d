//! Content store trait and implementations.
//!
//! A [`ContentStore`] is the leaf of the repository model: hosted stores own
//! their content, remote stores proxy an upstream, and group stores are
//! composed of other stores by the [`StoreRegistry`](crate::StoreRegistry)
//! rather than implementing this trait themselves.

mod local;
#[cfg(any(test, feature = "mock"))]
mod memory;

pub use self::local::LocalStore;
#[cfg(any(test, feature = "mock"))]
pub use self::memory::MemoryStore;
use crate::error::Result;
use crate::key::StoreKey;
use crate::models::FileInfo;
use crate::path::ContentPath;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified interface for content stores.
///
/// All operations are asynchronous to efficiently handle network operations
/// (remote proxies) and concurrent access. All paths are [`ContentPath`]s, so
/// validation has already happened by the time an implementation sees them.
///
/// # Examples
///
/// ```
/// use depot_storage::{ContentPath, ContentStore, error::Result};
///
/// async fn size_of(store: &dyn ContentStore, path: &ContentPath) -> Result<u64> {
///     if store.exists(path).await? {
///         Ok(store.read(path).await?.len() as u64)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Identity of this store. Used as a cache key component and in every
    /// log line about the store, so it must be stable for the store's lifetime.
    fn key(&self) -> &StoreKey;

    /// List all files matching an optional prefix.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list(&self, prefix: Option<&ContentPath>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream file metadata matching an optional prefix.
    ///
    /// Prefix matching is component-based: `org/foo` matches
    /// `org/foo/bar.pom` but not `org/foobar/baz.pom`. Listing a prefix that
    /// doesn't exist yields an empty stream, not an error.
    fn list_stream<'a>(&'a self, prefix: Option<&'a ContentPath>) -> FileInfoStream<'a>;

    /// Check if a file exists.
    async fn exists(&self, path: &ContentPath) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &ContentPath) -> Result<Vec<u8>>;

    /// Write file contents, creating or overwriting.
    async fn write(&self, path: &ContentPath, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &ContentPath) -> Result<()>;

    /// Get file metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn stat(&self, path: &ContentPath) -> Result<FileInfo>;
}
