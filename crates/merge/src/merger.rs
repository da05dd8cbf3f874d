//! Merge functions.
//!
//! A [`Merger`] turns the documents several constituents hold at one path into
//! a single document. Sources always arrive in group precedence order, and
//! that order breaks every tie.

use std::cmp::Ordering;
use std::sync::Arc;

use depot_storage::{ContentPath, StoreKey};

use crate::error::Result;
use crate::index::{VersionIndex, Versioning};
use crate::version::compare;

/// One constituent's document at the merged path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub store: StoreKey,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub bytes: Vec<u8>,
    /// Indices into the sources of every source that contributed.
    pub contributors: Vec<usize>,
}

pub trait Merger: Send + Sync {
    fn name(&self) -> &'static str;
    fn handles(&self, path: &ContentPath) -> bool;
    /// `sources` is never empty.
    fn merge(&self, path: &ContentPath, sources: &[Source]) -> Result<MergeOutput>;
}

/// Merges version indexes: versions are unioned and sorted, `latest` and
/// `release` are the greatest on offer, `lastUpdated` is the newest.
/// Coordinates come from the first source that has them.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionIndexMerger;

impl VersionIndexMerger {
    fn merge_indexes(indexes: &[VersionIndex]) -> VersionIndex {
        let mut merged = VersionIndex::default();
        for index in indexes {
            merged.group_id = merged.group_id.or_else(|| index.group_id.clone());
            merged.artifact_id = merged.artifact_id.or_else(|| index.artifact_id.clone());
            merged.version = merged.version.or_else(|| index.version.clone());
            let versioning = &index.versioning;
            for version in &versioning.versions {
                if !merged.versioning.versions.contains(version) {
                    merged.versioning.versions.push(version.clone());
                }
            }
            merged.versioning.latest = greatest(merged.versioning.latest, versioning.latest.as_ref(), compare);
            merged.versioning.release = greatest(merged.versioning.release, versioning.release.as_ref(), compare);
            merged.versioning.last_updated =
                greatest(merged.versioning.last_updated, versioning.last_updated.as_ref(), compare_timestamps);
        }
        // Stable, so versions that order equal keep precedence order.
        merged.versioning.versions.sort_by(|a, b| compare(a, b));
        merged
    }
}

/// Keep `current` unless `candidate` is strictly greater.
fn greatest(current: Option<String>, candidate: Option<&String>, cmp: fn(&str, &str) -> Ordering) -> Option<String> {
    match (current, candidate) {
        (Some(current), Some(candidate)) if cmp(candidate, &current) == Ordering::Greater => Some(candidate.clone()),
        (None, Some(candidate)) => Some(candidate.clone()),
        (current, _) => current,
    }
}

fn compare_timestamps(left: &str, right: &str) -> Ordering {
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

impl Merger for VersionIndexMerger {
    fn name(&self) -> &'static str {
        "version-index"
    }

    fn handles(&self, path: &ContentPath) -> bool {
        let name = path.file_name();
        name == "maven-metadata.xml" || (name.starts_with("maven-metadata-") && name.ends_with(".xml"))
    }

    fn merge(&self, _path: &ContentPath, sources: &[Source]) -> Result<MergeOutput> {
        let indexes = sources
            .iter()
            .map(|source| VersionIndex::parse(&source.bytes, &source.store.to_string()))
            .collect::<Result<Vec<_>>>()?;
        let merged = Self::merge_indexes(&indexes);
        Ok(MergeOutput { bytes: merged.render().into_bytes(), contributors: (0..sources.len()).collect() })
    }
}

/// Serves the first constituent's document untouched. Used for anything that
/// has no meaningful merge.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMatchMerger;

impl Merger for FirstMatchMerger {
    fn name(&self) -> &'static str {
        "first-match"
    }

    fn handles(&self, _path: &ContentPath) -> bool {
        true
    }

    fn merge(&self, _path: &ContentPath, sources: &[Source]) -> Result<MergeOutput> {
        let bytes = sources.first().map(|source| source.bytes.clone()).unwrap_or_default();
        Ok(MergeOutput { bytes, contributors: vec![0] })
    }
}

/// Picks the merger for a path: the first registered one that handles it,
/// otherwise the fallback.
#[derive(Clone)]
pub struct MergerSet {
    mergers: Vec<Arc<dyn Merger>>,
    fallback: Arc<dyn Merger>,
}
impl MergerSet {
    pub fn new(mergers: Vec<Arc<dyn Merger>>, fallback: Arc<dyn Merger>) -> Self {
        Self { mergers, fallback }
    }

    pub fn for_path(&self, path: &ContentPath) -> &dyn Merger {
        self.mergers
            .iter()
            .find(|merger| merger.handles(path))
            .unwrap_or(&self.fallback)
            .as_ref()
    }
}
impl Default for MergerSet {
    fn default() -> Self {
        Self::new(vec![Arc::new(VersionIndexMerger)], Arc::new(FirstMatchMerger))
    }
}
