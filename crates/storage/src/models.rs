//! Storage models.

use time::OffsetDateTime;

use crate::path::ContentPath;

/// File metadata returned by content stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative path from the store root
    pub path: ContentPath,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl FileInfo {
    pub fn new(path: ContentPath, size: u64, modified: impl Into<OffsetDateTime>) -> Self {
        Self { path, size, modified: modified.into() }
    }
}
