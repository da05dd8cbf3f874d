//! Promotion: moving content, or whole stores, into other stores.
//!
//! Promotion is a thin orchestration over the registry. Group promotion adds a
//! store to a group's membership; path promotion copies content between two
//! stores. Both go through the registry, so the usual change events fire.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::key::StoreKey;
use crate::path::ContentPath;
use crate::registry::StoreRegistry;

/// Request to add `source` to the group named `target_group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPromoteRequest {
    pub source: StoreKey,
    pub target_group: String,
    #[serde(default)]
    pub dry_run: bool,
}
impl GroupPromoteRequest {
    pub fn new(source: StoreKey, target_group: impl Into<String>) -> Self {
        Self { source, target_group: target_group.into(), dry_run: false }
    }

    pub fn target_key(&self) -> StoreKey {
        StoreKey::group(&self.target_group)
    }
}

/// Request to copy content from one store into another.
///
/// An empty `paths` list means "everything in the source".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsPromoteRequest {
    pub source: StoreKey,
    pub target: StoreKey,
    #[serde(default)]
    pub paths: Vec<ContentPath>,
    /// Delete each path from the source once it has been copied.
    #[serde(default)]
    pub purge_source: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PathsPromoteResult {
    pub completed: Vec<ContentPath>,
    /// Requested paths the source doesn't have.
    pub skipped: Vec<ContentPath>,
}

/// Add the request's source store to the target group, at lowest precedence.
///
/// Returns `false` when the source was already a member (or for a dry run),
/// in which case no membership event is published.
#[instrument(skip_all, fields(source = %request.source, group = %request.target_group))]
pub fn promote_to_group(registry: &StoreRegistry, request: &GroupPromoteRequest) -> Result<bool> {
    let target = request.target_key();
    let mut group = registry
        .group(&target)
        .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownStore(target.to_string())))?;
    if !group.add_constituent(request.source.clone())? {
        tracing::debug!("Source is already a member of the group");
        return Ok(false);
    }
    if request.dry_run {
        return Ok(false);
    }
    Ok(registry.update_group(group))
}

/// Copy content from the source store to the target store.
#[instrument(skip_all, fields(source = %request.source, target = %request.target))]
pub async fn promote_paths(registry: &StoreRegistry, request: &PathsPromoteRequest) -> Result<PathsPromoteResult> {
    let source = registry
        .store(&request.source)
        .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownStore(request.source.to_string())))?;
    let paths = match request.paths.is_empty() {
        true => source.list(None).await?.into_iter().map(|info| info.path).collect(),
        false => request.paths.clone(),
    };
    let mut result = PathsPromoteResult::default();
    for path in paths {
        let Some(data) = registry.get(&request.source, &path).await? else {
            result.skipped.push(path);
            continue;
        };
        registry.put(&request.target, &path, &data).await?;
        if request.purge_source {
            registry.delete(&request.source, &path).await?;
        }
        result.completed.push(path);
    }
    tracing::info!(completed = result.completed.len(), skipped = result.skipped.len(), "Promotion complete");
    Ok(result)
}
