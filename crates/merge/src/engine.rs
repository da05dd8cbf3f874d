//! The merge engine: cached, single-flight merges of group content.
//!
//! A read checks the cache, and on a miss fetches the path from every
//! constituent in precedence order, merges whatever exists, and caches the
//! result. Cached merges are never revalidated; they are dropped by
//! [`invalidate`](MergeEngine::invalidate) and
//! [`invalidate_all_for_group`](MergeEngine::invalidate_all_for_group) when a
//! constituent changes.
//!
//! Each group carries a generation number that every invalidation bumps. A
//! recompute remembers the generation it started under and only caches its
//! result if nothing has been invalidated since, so a merge computed from
//! content that changed mid-flight is returned once and then forgotten.

use exn::ResultExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use depot_cache::CacheHandle;
use depot_storage::error::ErrorKind as StorageErrorKind;
use depot_storage::{ContentPath, GroupDefinition, StoreHandle, StoreKey, StoreRegistry};

use crate::MergeKey;
use crate::document::{Fingerprint, MergedDocument};
use crate::error::{ErrorKind, Result};
use crate::flight::Flights;
use crate::merger::{MergerSet, Source};

/// The cache merged documents live in.
pub type MergeCache = CacheHandle<MergeKey, Arc<MergedDocument>>;

/// Where the materialized copy of `path` in `group` lives: `<type>-<name>/<path>`.
pub fn materialized_path(group: &StoreKey, path: &ContentPath) -> Result<ContentPath> {
    ContentPath::parse(format!("{}/{path}", group.materialized_prefix())).or_raise(|| ErrorKind::Materialize)
}

/// What a recompute produced, and whether it skipped a cyclic member.
struct Recomputed {
    document: Option<Arc<MergedDocument>>,
    partial: bool,
}

/// Per-group invalidation stamps drawn from one increasing sequence. Groups
/// pruned from the map read as `floor`, which moves past every stamp handed
/// out before the prune.
#[derive(Default)]
struct Generations {
    sequence: u64,
    floor: u64,
    groups: HashMap<StoreKey, u64>,
}

impl Generations {
    fn get(&self, group: &StoreKey) -> u64 {
        self.groups.get(group).copied().unwrap_or(self.floor)
    }

    fn bump(&mut self, group: &StoreKey) {
        self.sequence += 1;
        self.groups.insert(group.clone(), self.sequence);
    }

    fn prune(&mut self, keep: impl Fn(&StoreKey) -> bool) {
        self.sequence += 1;
        self.floor = self.sequence;
        self.groups.retain(|group, _| keep(group));
    }
}

pub struct MergeEngine {
    registry: Arc<StoreRegistry>,
    cache: Arc<MergeCache>,
    mergers: MergerSet,
    materialize: Option<StoreHandle>,
    timeout: Option<Duration>,
    generations: Mutex<Generations>,
    flights: Flights,
}

impl MergeEngine {
    pub fn new(registry: Arc<StoreRegistry>, cache: Arc<MergeCache>) -> Self {
        Self {
            registry,
            cache,
            mergers: MergerSet::default(),
            materialize: None,
            timeout: None,
            generations: Mutex::default(),
            flights: Flights::default(),
        }
    }

    pub fn with_mergers(mut self, mergers: MergerSet) -> Self {
        self.mergers = mergers;
        self
    }

    /// Persist every cached merge to `store` as well, for direct serving.
    pub fn with_materialization(mut self, store: StoreHandle) -> Self {
        self.materialize = Some(store);
        self
    }

    /// Deadline applied by [`read`](Self::read).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MergeCache> {
        &self.cache
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the merged document for `path` in `group`.
    ///
    /// `Ok(None)` means no constituent has the path. An error means the merge
    /// could not be computed (a constituent failed, or the deadline passed),
    /// and nothing was cached.
    #[instrument(skip_all, fields(group = %group.key(), path = %path))]
    pub async fn read(&self, group: &GroupDefinition, path: &ContentPath) -> Result<Option<Arc<MergedDocument>>> {
        self.read_within(group, path, self.timeout).await
    }

    /// [`read`](Self::read), giving up after `timeout`. The deadline covers
    /// the whole recompute, not each constituent fetch.
    #[instrument(skip_all, fields(group = %group.key(), path = %path, timeout = ?timeout))]
    pub async fn read_with_timeout(
        &self,
        group: &GroupDefinition,
        path: &ContentPath,
        timeout: Duration,
    ) -> Result<Option<Arc<MergedDocument>>> {
        self.read_within(group, path, Some(timeout)).await
    }

    async fn read_within(
        &self,
        group: &GroupDefinition,
        path: &ContentPath,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<MergedDocument>>> {
        let read = self.read_member(group, path);
        let Some(timeout) = timeout else {
            return read.await;
        };
        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?timeout, "Merge recompute timed out");
                exn::bail!(ErrorKind::Timeout(timeout));
            },
        }
    }

    async fn read_member(&self, group: &GroupDefinition, path: &ContentPath) -> Result<Option<Arc<MergedDocument>>> {
        let key: MergeKey = (group.key().clone(), path.clone());
        if let Some(document) = self.cache.get(&key) {
            tracing::debug!(group = %group.key(), %path, "Merge cache hit");
            return Ok(Some(document));
        }
        // Lands the flight even when a timeout drops this future mid-recompute.
        let landing = self.flights.board(key);
        let recompute = || async { self.recompute(group, path, Vec::new()).await.map(|recomputed| recomputed.document) };
        let outcome = landing.flight().get_or_init(recompute).await.clone();
        outcome.map_err(exn::Exn::from)
    }

    /// Nested groups are recomputed inline rather than through a flight: with
    /// cyclic membership, two flights could otherwise wait on each other.
    fn recompute_nested<'a>(
        &'a self,
        group: &'a GroupDefinition,
        path: &'a ContentPath,
        visiting: Vec<StoreKey>,
    ) -> BoxFuture<'a, std::result::Result<Recomputed, ErrorKind>> {
        Box::pin(self.recompute(group, path, visiting))
    }

    /// `visiting` holds the groups already being merged further up, so that
    /// membership cycles end instead of recursing forever.
    async fn recompute(
        &self,
        group: &GroupDefinition,
        path: &ContentPath,
        visiting: Vec<StoreKey>,
    ) -> std::result::Result<Recomputed, ErrorKind> {
        let key: MergeKey = (group.key().clone(), path.clone());
        // An earlier flight may have finished between our cache check and
        // joining this one.
        if let Some(document) = self.cache.get(&key) {
            return Ok(Recomputed { document: Some(document), partial: false });
        }
        tracing::debug!(group = %group.key(), %path, "Merge cache miss");
        // Skipping a cyclic member loses nothing at the top of the cycle, which
        // merges that member's other constituents itself. A nested group's
        // result is then incomplete on its own terms.
        let top_level = visiting.is_empty();
        let generation = self.generation(group.key());
        let (document, partial) = match self.merge(group, path, visiting).await {
            Ok((Some(document), partial)) => (Arc::new(document), partial),
            Ok((None, partial)) => {
                tracing::debug!(group = %group.key(), %path, "No constituent has the path");
                return Ok(Recomputed { document: None, partial });
            },
            Err(err) => {
                tracing::error!(group = %group.key(), %path, error = ?err, "Merge recompute failed");
                return Err((*err).clone());
            },
        };
        if partial && !top_level {
            tracing::debug!(group = %group.key(), %path, "Not caching merge that skipped a cyclic member");
            return Ok(Recomputed { document: Some(document), partial });
        }
        match self.store(&key, generation, &document) {
            Ok(true) => self.materialize(&key, generation, &document).await,
            Ok(false) => {},
            Err(err) => tracing::warn!(group = %group.key(), %path, error = ?err, "Failed to cache merged document"),
        }
        Ok(Recomputed { document: Some(document), partial })
    }

    /// The merged document, if any constituent has the path, and whether a
    /// cyclic member was skipped on the way.
    async fn merge(
        &self,
        group: &GroupDefinition,
        path: &ContentPath,
        mut visiting: Vec<StoreKey>,
    ) -> Result<(Option<MergedDocument>, bool)> {
        visiting.push(group.key().clone());
        let mut sources = Vec::new();
        let mut partial = false;
        for member in group.constituents() {
            let bytes = match member.is_group() {
                true => {
                    let (bytes, skipped) = self.read_nested(member, path, &visiting).await?;
                    partial |= skipped;
                    bytes
                },
                false => self.fetch(member, path).await?,
            };
            if let Some(bytes) = bytes {
                sources.push(Source { store: member.clone(), bytes });
            }
        }
        if sources.is_empty() {
            return Ok((None, partial));
        }
        let merger = self.mergers.for_path(path);
        let output = merger.merge(path, &sources)?;
        let fingerprints: Vec<Fingerprint> = output
            .contributors
            .iter()
            .filter_map(|&index| sources.get(index))
            .map(|source| Fingerprint::of(source.store.clone(), &source.bytes))
            .collect();
        tracing::debug!(merger = merger.name(), contributors = fingerprints.len(), "Merged constituents");
        Ok((Some(MergedDocument::new(output.bytes, fingerprints)), partial))
    }

    async fn fetch(&self, store: &StoreKey, path: &ContentPath) -> Result<Option<Vec<u8>>> {
        match self.registry.get(store, path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if matches!(&*err, StorageErrorKind::UnknownStore(_)) => {
                tracing::warn!(%store, "Skipping unregistered constituent");
                Ok(None)
            },
            Err(err) => Err(err).or_raise(|| ErrorKind::Fetch { store: store.to_string(), path: path.to_string() }),
        }
    }

    async fn read_nested(
        &self,
        member: &StoreKey,
        path: &ContentPath,
        visiting: &[StoreKey],
    ) -> Result<(Option<Vec<u8>>, bool)> {
        if visiting.contains(member) {
            tracing::debug!(group = %member, "Skipping cyclic group membership");
            return Ok((None, true));
        }
        let Some(nested) = self.registry.group(member) else {
            tracing::warn!(group = %member, "Skipping unregistered constituent group");
            return Ok((None, false));
        };
        let recomputed = self.recompute_nested(&nested, path, visiting.to_vec()).await.map_err(exn::Exn::from)?;
        Ok((recomputed.document.map(|document| document.bytes().to_vec()), recomputed.partial))
    }

    // =========================================================================
    // Cache bookkeeping
    // =========================================================================

    fn generation(&self, group: &StoreKey) -> u64 {
        self.generations.lock().get(group)
    }

    fn bump(&self, group: &StoreKey) {
        self.generations.lock().bump(group);
    }

    /// Cache `document` if the group is still at `generation`.
    ///
    /// The key lock is taken first, outside the generations lock, since it may
    /// wait. The generation check, put and commit then run under the
    /// generations lock, so an invalidation either bumps first (and we skip
    /// caching) or bumps after the commit (and evicts what we stored).
    fn store(&self, key: &MergeKey, generation: u64, document: &Arc<MergedDocument>) -> Result<bool> {
        if self.cache.begin_transaction().or_raise(|| ErrorKind::Cache)?.is_none() {
            return Ok(false);
        }
        if self.cache.lock(std::slice::from_ref(key)) != Some(true) {
            self.cache.rollback().or_raise(|| ErrorKind::Cache)?;
            return Ok(false);
        }
        let generations = self.generations.lock();
        if generations.get(&key.0) != generation {
            drop(generations);
            tracing::debug!(group = %key.0, path = %key.1, "Group changed during recompute, not caching");
            self.cache.rollback().or_raise(|| ErrorKind::Cache)?;
            return Ok(false);
        }
        self.cache.put(key.clone(), Arc::clone(document));
        self.cache.commit().or_raise(|| ErrorKind::Cache)?;
        drop(generations);
        Ok(true)
    }

    /// Remove `keys` from the cache in one locked transaction. Keys are
    /// expected in sorted order, so concurrent evictions lock consistently.
    fn evict(&self, keys: &[MergeKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        if self.cache.begin_transaction().or_raise(|| ErrorKind::Cache)?.is_none() {
            return Ok(0);
        }
        if self.cache.lock(keys) != Some(true) {
            self.cache.rollback().or_raise(|| ErrorKind::Cache)?;
            exn::bail!(ErrorKind::Cache);
        }
        let removed = keys.iter().filter(|key| self.cache.remove(key).is_some()).count();
        self.cache.commit().or_raise(|| ErrorKind::Cache)?;
        Ok(removed)
    }

    async fn materialize(&self, key: &MergeKey, generation: u64, document: &MergedDocument) {
        let Some(store) = &self.materialize else {
            return;
        };
        let target = match materialized_path(&key.0, &key.1) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(error = ?err, "Cannot materialize merged document");
                return;
            },
        };
        if let Err(err) = store.write(&target, document.bytes()).await {
            tracing::warn!(path = %target, error = ?err, "Failed to materialize merged document");
            return;
        }
        // An invalidation that ran during the write deleted the old copy
        // before ours landed.
        if self.generation(&key.0) != generation
            && let Err(err) = store.delete(&target).await
            && !err.is_not_found()
        {
            tracing::warn!(path = %target, error = ?err, "Failed to remove stale materialized document");
        }
    }

    async fn remove_materialized(&self, group: &StoreKey, path: &ContentPath) -> Result<bool> {
        let Some(store) = &self.materialize else {
            return Ok(false);
        };
        let target = materialized_path(group, path)?;
        match store.delete(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err).or_raise(|| ErrorKind::Materialize),
        }
    }

    /// Delete every materialized file of `group`, cached or not.
    async fn sweep_materialized(&self, group: &StoreKey) -> Result<usize> {
        let Some(store) = &self.materialize else {
            return Ok(0);
        };
        let prefix = ContentPath::parse(group.materialized_prefix()).or_raise(|| ErrorKind::Materialize)?;
        let files = store.list(Some(&prefix)).await.or_raise(|| ErrorKind::Materialize)?;
        let mut swept = 0;
        for file in files {
            match store.delete(&file.path).await {
                Ok(()) => swept += 1,
                Err(err) if err.is_not_found() => {},
                Err(err) => return Err(err).or_raise(|| ErrorKind::Materialize),
            }
        }
        Ok(swept)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop the cached merge of `path` in `group`, and its materialized copy.
    /// Invalidating something that was never cached is a no-op.
    #[instrument(skip_all, fields(group = %group.key(), path = %path))]
    pub async fn invalidate(&self, group: &GroupDefinition, path: &ContentPath) -> Result<()> {
        let key: MergeKey = (group.key().clone(), path.clone());
        self.bump(group.key());
        self.flights.forget(&key);
        let removed = self.evict(std::slice::from_ref(&key))?;
        let deleted = self.remove_materialized(group.key(), path).await?;
        tracing::debug!(removed, deleted, "Invalidated merged path");
        Ok(())
    }

    /// Drop every cached merge of `group`. Used when membership changes, since
    /// constituent order alone changes merge results.
    #[instrument(skip_all, fields(group = %group.key()))]
    pub async fn invalidate_all_for_group(&self, group: &GroupDefinition) -> Result<()> {
        let (removed, swept) = self.invalidate_group_key(group.key()).await?;
        tracing::info!(removed, swept, "Invalidated every merged path in group");
        Ok(())
    }

    /// Drop every cached merge, including those of groups that no longer exist.
    #[instrument(skip_all)]
    pub async fn invalidate_all(&self) -> Result<()> {
        let mut groups: BTreeSet<StoreKey> = self.registry.groups().into_iter().map(|group| group.key().clone()).collect();
        groups.extend(self.cache.keys_matching(|_| true).into_iter().map(|(group, _)| group));
        for group in &groups {
            self.invalidate_group_key(group).await?;
        }
        let registered: BTreeSet<StoreKey> =
            self.registry.groups().into_iter().map(|group| group.key().clone()).collect();
        self.generations.lock().prune(|group| registered.contains(group));
        tracing::info!(groups = groups.len(), "Invalidated every merged path");
        Ok(())
    }

    async fn invalidate_group_key(&self, group: &StoreKey) -> Result<(usize, usize)> {
        self.bump(group);
        self.flights.forget_group(group);
        let mut keys: Vec<MergeKey> = self.cache.keys_matching(|(key, _)| key == group).into_iter().collect();
        keys.sort();
        let removed = self.evict(&keys)?;
        let swept = self.sweep_materialized(group).await?;
        Ok((removed, swept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VersionIndex;
    use async_trait::async_trait;
    use depot_cache::{MemoryCache, MemoryCacheOptions};
    use depot_storage::store::FileInfoStream;
    use depot_storage::{ContentStore, FileInfo, MemoryStore};

    const PATH: &str = "org/foo/bar/maven-metadata.xml";

    fn path() -> ContentPath {
        ContentPath::parse(PATH).unwrap()
    }

    fn metadata(version: &str, last_updated: &str) -> String {
        format!(
            "<metadata><groupId>org.foo</groupId><artifactId>bar</artifactId><versioning>\
             <latest>{version}</latest><release>{version}</release><versions><version>{version}</version></versions>\
             <lastUpdated>{last_updated}</lastUpdated></versioning></metadata>"
        )
    }

    fn memory_cache() -> Arc<MergeCache> {
        let cache: Arc<MemoryCache<MergeKey, Arc<MergedDocument>>> =
            Arc::new(MemoryCache::new("merge", MemoryCacheOptions::default()));
        Arc::new(CacheHandle::new("merge", cache))
    }

    struct Fixture {
        registry: Arc<StoreRegistry>,
        stores: Vec<Arc<MemoryStore>>,
        engine: MergeEngine,
    }

    /// A group `test` over one remote store per `(name, content)`.
    fn fixture(members: &[(&str, Option<String>)]) -> Fixture {
        let registry = Arc::new(StoreRegistry::default());
        let mut stores = Vec::new();
        for (name, content) in members {
            let store = Arc::new(match content {
                Some(content) => MemoryStore::with_files(StoreKey::remote(*name), [(PATH, content.clone())]),
                None => MemoryStore::new(StoreKey::remote(*name)),
            });
            registry.add_store(store.clone()).unwrap();
            stores.push(store);
        }
        let constituents = members.iter().map(|(name, _)| StoreKey::remote(*name));
        registry.update_group(GroupDefinition::new(StoreKey::group("test"), constituents).unwrap());
        let engine = MergeEngine::new(registry.clone(), memory_cache());
        Fixture { registry, stores, engine }
    }

    impl Fixture {
        fn group(&self) -> GroupDefinition {
            self.registry.group(&StoreKey::group("test")).unwrap()
        }

        fn reads(&self) -> usize {
            self.stores.iter().map(|store| store.read_count()).sum()
        }

        fn cached(&self) -> bool {
            self.engine.cache().contains_key(&(StoreKey::group("test"), path()))
        }
    }

    #[tokio::test]
    async fn test_merge_union_and_precedence() {
        let f = fixture(&[
            ("repo1", Some(metadata("1.0", "20150722164334"))),
            ("repo2", Some(metadata("1.1", "20150822164334"))),
        ]);
        let document = f.engine.read(&f.group(), &path()).await.unwrap().unwrap();
        let index = VersionIndex::parse(document.bytes(), "merged").unwrap();
        assert_eq!(index.versioning.versions, ["1.0", "1.1"]);
        assert_eq!(index.versioning.latest.as_deref(), Some("1.1"));
        assert_eq!(index.versioning.last_updated.as_deref(), Some("20150822164334"));
        let stores: Vec<_> = document.fingerprints().iter().map(|fp| fp.store.clone()).collect();
        assert_eq!(stores, [StoreKey::remote("repo1"), StoreKey::remote("repo2")]);
    }

    #[tokio::test]
    async fn test_cache_hit_does_not_refetch() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1"))), ("repo2", None)]);
        let first = f.engine.read(&f.group(), &path()).await.unwrap().unwrap();
        assert_eq!(f.reads(), 2);
        let second = f.engine.read(&f.group(), &path()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.reads(), 2);
        // Only the constituent that had the path contributed.
        assert_eq!(first.fingerprints().len(), 1);
    }

    #[tokio::test]
    async fn test_absent_everywhere_is_not_cached() {
        let f = fixture(&[("repo1", None), ("repo2", None)]);
        assert_eq!(f.engine.read(&f.group(), &path()).await.unwrap(), None);
        assert!(!f.cached());
        assert_eq!(f.engine.read(&f.group(), &path()).await.unwrap(), None);
        assert_eq!(f.reads(), 4);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_an_error_and_not_cached() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1"))), ("repo2", Some(metadata("1.1", "2")))]);
        f.stores[1].fail_reads_of(&path());
        let err = f.engine.read(&f.group(), &path()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Fetch { store, .. } if store == "remote:repo2"));
        assert!(err.is_retryable());
        assert!(!f.cached());
    }

    #[tokio::test]
    async fn test_unregistered_constituents_are_skipped() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        let mut group = f.group();
        group.add_constituent(StoreKey::remote("gone")).unwrap();
        group.add_constituent(StoreKey::group("missing")).unwrap();
        let document = f.engine.read(&group, &path()).await.unwrap().unwrap();
        assert_eq!(document.fingerprints().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        f.engine.invalidate(&f.group(), &path()).await.unwrap();
        f.engine.invalidate(&f.group(), &path()).await.unwrap();
        assert!(!f.cached());
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        f.engine.read(&f.group(), &path()).await.unwrap();
        assert!(f.cached());
        f.stores[0].write(&path(), metadata("2.0", "2").as_bytes()).await.unwrap();
        f.engine.invalidate(&f.group(), &path()).await.unwrap();
        assert!(!f.cached());
        let document = f.engine.read(&f.group(), &path()).await.unwrap().unwrap();
        let index = VersionIndex::parse(document.bytes(), "merged").unwrap();
        assert_eq!(index.versioning.latest.as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn test_invalidate_all_for_group() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        let pom = ContentPath::parse("org/foo/bar/1.0/bar-1.0.pom").unwrap();
        f.stores[0].write(&pom, b"<project/>").await.unwrap();
        f.engine.read(&f.group(), &path()).await.unwrap();
        f.engine.read(&f.group(), &pom).await.unwrap();
        assert_eq!(f.engine.cache().keys_matching(|_| true).len(), 2);
        f.engine.invalidate_all_for_group(&f.group()).await.unwrap();
        assert!(f.engine.cache().keys_matching(|_| true).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_share_one_recompute() {
        let f = Arc::new(fixture(&[
            ("repo1", Some(metadata("1.0", "1"))),
            ("repo2", Some(metadata("1.1", "2"))),
        ]));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let f = Arc::clone(&f);
                tokio::spawn(async move { f.engine.read(&f.group(), &path()).await.unwrap().unwrap() })
            })
            .collect();
        let mut documents = Vec::new();
        for task in tasks {
            documents.push(task.await.unwrap());
        }
        assert_eq!(f.reads(), 2);
        assert!(documents.iter().all(|document| Arc::ptr_eq(document, &documents[0])));
    }

    #[tokio::test]
    async fn test_stopped_cache_still_serves_merges() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        f.engine.cache().stop();
        assert!(f.engine.read(&f.group(), &path()).await.unwrap().is_some());
        assert!(f.engine.read(&f.group(), &path()).await.unwrap().is_some());
        assert_eq!(f.reads(), 2);
        f.engine.invalidate(&f.group(), &path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_groups() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        let inner = MemoryStore::with_files(StoreKey::hosted("inner-repo"), [(PATH, metadata("3.0", "3"))]);
        f.registry.add_store(Arc::new(inner)).unwrap();
        f.registry.update_group(GroupDefinition::new(StoreKey::group("inner"), [StoreKey::hosted("inner-repo")]).unwrap());
        let outer = GroupDefinition::new(StoreKey::group("outer"), [StoreKey::group("test"), StoreKey::group("inner")]).unwrap();
        let document = f.engine.read(&outer, &path()).await.unwrap().unwrap();
        let index = VersionIndex::parse(document.bytes(), "merged").unwrap();
        assert_eq!(index.versioning.versions, ["1.0", "3.0"]);
        assert!(document.is_derived_from(&StoreKey::group("inner")));
        // The nested merges were cached on the way.
        assert!(f.cached());
    }

    #[tokio::test]
    async fn test_cyclic_groups_terminate() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        let mut test = f.group();
        test.add_constituent(StoreKey::group("loop")).unwrap();
        f.registry.update_group(test.clone());
        f.registry.update_group(GroupDefinition::new(StoreKey::group("loop"), [StoreKey::group("test")]).unwrap());
        let document = f.engine.read(&test, &path()).await.unwrap().unwrap();
        assert!(document.is_derived_from(&StoreKey::remote("repo1")));
    }

    #[tokio::test]
    async fn test_cycle_read_from_either_end_merges_everything() {
        let registry = Arc::new(StoreRegistry::default());
        for (name, version) in [("x", "1.0"), ("y", "2.0")] {
            let store = MemoryStore::with_files(StoreKey::hosted(name), [(PATH, metadata(version, "1"))]);
            registry.add_store(Arc::new(store)).unwrap();
        }
        let a = GroupDefinition::new(StoreKey::group("a"), [StoreKey::group("b"), StoreKey::hosted("x")]).unwrap();
        let b = GroupDefinition::new(StoreKey::group("b"), [StoreKey::group("a"), StoreKey::hosted("y")]).unwrap();
        registry.update_group(a.clone());
        registry.update_group(b.clone());
        let versions = |document: Arc<MergedDocument>| VersionIndex::parse(document.bytes(), "merged").unwrap().versioning.versions;

        let engine = MergeEngine::new(registry.clone(), memory_cache());
        assert_eq!(versions(engine.read(&a, &path()).await.unwrap().unwrap()), ["1.0", "2.0"]);
        // b was merged without a while reading a, so that result stays uncached.
        assert!(engine.cache().contains_key(&(StoreKey::group("a"), path())));
        assert!(!engine.cache().contains_key(&(StoreKey::group("b"), path())));
        assert_eq!(versions(engine.read(&b, &path()).await.unwrap().unwrap()), ["1.0", "2.0"]);

        let fresh = MergeEngine::new(registry, memory_cache());
        assert_eq!(versions(fresh.read(&b, &path()).await.unwrap().unwrap()), ["1.0", "2.0"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_on_one_key_lock_does_not_stall_other_groups() {
        let f = Arc::new(fixture(&[("repo1", Some(metadata("1.0", "1")))]));
        let other = GroupDefinition::new(StoreKey::group("other"), [StoreKey::remote("repo1")]).unwrap();
        let third = GroupDefinition::new(StoreKey::group("third"), [StoreKey::remote("repo1")]).unwrap();
        f.registry.update_group(other.clone());
        f.registry.update_group(third.clone());

        // Another thread holds the lock on the test group's key.
        let cache = Arc::clone(f.engine.cache().cache());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            cache.transaction_manager().begin().unwrap();
            assert!(cache.lock(&[(StoreKey::group("test"), path())]).unwrap());
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            cache.transaction_manager().commit().unwrap();
        });
        locked_rx.recv().unwrap();

        let blocked = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.engine.read(&f.group(), &path()).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let read = tokio::time::timeout(Duration::from_secs(2), f.engine.read(&other, &path())).await;
        assert!(read.unwrap().unwrap().is_some());
        let invalidated = tokio::time::timeout(Duration::from_secs(2), f.engine.invalidate_all_for_group(&third)).await;
        assert!(invalidated.unwrap().is_ok());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(blocked.await.unwrap().is_some());
        assert!(f.cached());
    }

    #[tokio::test]
    async fn test_invalidate_all_forgets_removed_groups() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        let gone = GroupDefinition::new(StoreKey::group("gone"), [StoreKey::remote("repo1")]).unwrap();
        f.registry.update_group(gone.clone());
        f.engine.read(&gone, &path()).await.unwrap();
        f.engine.invalidate_all_for_group(&gone).await.unwrap();
        f.registry.remove_group(gone.key());

        f.engine.invalidate_all().await.unwrap();
        let generations = f.engine.generations.lock();
        assert!(!generations.groups.contains_key(gone.key()));
        assert!(generations.groups.contains_key(&StoreKey::group("test")));
    }

    #[test]
    fn test_pruned_generations_never_match_older_stamps() {
        let mut generations = Generations::default();
        let group = StoreKey::group("g");
        let never_bumped = generations.get(&group);
        generations.bump(&group);
        let bumped = generations.get(&group);
        generations.prune(|_| false);
        assert_ne!(generations.get(&group), never_bumped);
        assert_ne!(generations.get(&group), bumped);
    }

    /// A store whose reads never complete.
    struct HangingStore(StoreKey);

    #[async_trait]
    impl ContentStore for HangingStore {
        fn key(&self) -> &StoreKey {
            &self.0
        }

        fn list_stream<'a>(&'a self, _prefix: Option<&'a ContentPath>) -> FileInfoStream<'a> {
            Box::pin(futures::stream::empty())
        }

        async fn exists(&self, _path: &ContentPath) -> depot_storage::error::Result<bool> {
            Ok(true)
        }

        async fn read(&self, _path: &ContentPath) -> depot_storage::error::Result<Vec<u8>> {
            std::future::pending().await
        }

        async fn write(&self, _path: &ContentPath, _data: &[u8]) -> depot_storage::error::Result<()> {
            Ok(())
        }

        async fn delete(&self, _path: &ContentPath) -> depot_storage::error::Result<()> {
            Ok(())
        }

        async fn stat(&self, path: &ContentPath) -> depot_storage::error::Result<FileInfo> {
            Ok(FileInfo::new(path.clone(), 0, time::OffsetDateTime::UNIX_EPOCH))
        }
    }

    #[tokio::test]
    async fn test_timeout_caches_nothing() {
        let f = fixture(&[("repo1", Some(metadata("1.0", "1")))]);
        f.registry.add_store(Arc::new(HangingStore(StoreKey::remote("slow")))).unwrap();
        let mut group = f.group();
        group.add_constituent(StoreKey::remote("slow")).unwrap();
        let err = f.engine.read_with_timeout(&group, &path(), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout(_)));
        assert!(!f.cached());
        // The abandoned recompute does not leave its flight behind.
        assert_eq!(f.engine.flights.len(), 0);

        let engine = MergeEngine::new(f.registry.clone(), memory_cache()).with_timeout(Duration::from_millis(50));
        assert!(engine.read(&group, &path()).await.is_err());
    }
}
