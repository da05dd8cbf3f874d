//! Merged views of group content for depot.
//!
//! A group presents the union of its constituents. For most paths the first
//! constituent that has the file wins, but version indexes
//! (`maven-metadata.xml`) are merged across every constituent. Merging is
//! expensive, so [`MergeEngine`] caches each merge in a transactional cache
//! and drops it when a [`ChangeListener`] reports that a constituent changed.

pub mod error;
mod document;
mod engine;
mod flight;
pub mod index;
mod listener;
pub mod merger;
pub mod version;

use depot_storage::{ContentPath, StoreKey};

pub use crate::document::{Fingerprint, MergedDocument};
pub use crate::engine::{MergeCache, MergeEngine, materialized_path};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::index::{VersionIndex, Versioning};
pub use crate::listener::{
    ChangeListener, DEFAULT_INVALIDATION_BUFFER, Invalidation, InvalidationTasks, InvalidationWorker,
};
pub use crate::merger::{FirstMatchMerger, MergeOutput, Merger, MergerSet, Source, VersionIndexMerger};

/// Cache key of one merged document: the group and the path within it.
pub type MergeKey = (StoreKey, ContentPath);
