//! Turning store events into cache invalidations.
//!
//! [`ChangeListener`] subscribes to the registry's event bus and translates
//! each event into [`Invalidation`] commands: a content change invalidates
//! that path in every group containing the store (transitively), a membership
//! change invalidates everything cached for the group and for every group
//! containing it. The commands go over a channel to an
//! [`InvalidationWorker`], which applies them to the [`MergeEngine`].

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use depot_storage::{ContentPath, GroupDefinition, StoreEvent, StoreRegistry};

use crate::engine::MergeEngine;
use crate::error::Result;

/// Default capacity of the listener to worker channel.
pub const DEFAULT_INVALIDATION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Drop one merged path.
    Path { group: GroupDefinition, path: ContentPath },
    /// Drop everything merged for a group.
    Group { group: GroupDefinition },
    /// Drop everything. Sent when the listener missed events.
    All,
}

pub struct ChangeListener {
    registry: Arc<StoreRegistry>,
    events: broadcast::Receiver<StoreEvent>,
    commands: mpsc::Sender<Invalidation>,
}

impl ChangeListener {
    /// Subscribes immediately, so events published after this returns are
    /// seen even if [`run`](Self::run) starts later.
    pub fn new(registry: Arc<StoreRegistry>, commands: mpsc::Sender<Invalidation>) -> Self {
        let events = registry.events().subscribe();
        Self { registry, events, commands }
    }

    pub fn invalidations_for(&self, event: &StoreEvent) -> Vec<Invalidation> {
        match event {
            StoreEvent::ContentChanged { store, path } => self
                .registry
                .groups_containing(store)
                .into_iter()
                .map(|group| Invalidation::Path { group, path: path.clone() })
                .collect(),
            StoreEvent::MembershipChanged { group } => std::iter::once(group.clone())
                .chain(self.registry.groups_containing(group.key()))
                .map(|group| Invalidation::Group { group })
                .collect(),
        }
    }

    /// Forward invalidations until the event bus or the worker goes away.
    pub async fn run(mut self) {
        tracing::info!("Change listener started");
        loop {
            let commands = match self.events.recv().await {
                Ok(event) => {
                    tracing::debug!(event = event.kind(), "Store event received");
                    self.invalidations_for(&event)
                },
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Change listener fell behind, invalidating everything");
                    vec![Invalidation::All]
                },
                Err(RecvError::Closed) => break,
            };
            for command in commands {
                if self.commands.send(command).await.is_err() {
                    tracing::debug!("Invalidation worker has stopped");
                    return;
                }
            }
        }
        tracing::info!("Change listener stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

pub struct InvalidationWorker {
    engine: Arc<MergeEngine>,
    commands: mpsc::Receiver<Invalidation>,
}

impl InvalidationWorker {
    pub fn new(engine: Arc<MergeEngine>, commands: mpsc::Receiver<Invalidation>) -> Self {
        Self { engine, commands }
    }

    pub async fn apply(engine: &MergeEngine, command: &Invalidation) -> Result<()> {
        match command {
            Invalidation::Path { group, path } => engine.invalidate(group, path).await,
            Invalidation::Group { group } => engine.invalidate_all_for_group(group).await,
            Invalidation::All => engine.invalidate_all().await,
        }
    }

    /// Apply commands until every sender is gone. A failed invalidation is
    /// logged and the worker carries on.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            if let Err(err) = Self::apply(&self.engine, &command).await {
                tracing::error!(?command, error = ?err, "Invalidation failed");
            }
        }
        tracing::info!("Invalidation worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// The two tasks keeping an engine's cache in step with its registry.
pub struct InvalidationTasks {
    pub listener: JoinHandle<()>,
    pub worker: JoinHandle<()>,
}

impl InvalidationTasks {
    /// Wire a listener on the engine's registry to a worker on the engine.
    pub fn spawn(engine: Arc<MergeEngine>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        let listener = ChangeListener::new(Arc::clone(engine.registry()), tx).spawn();
        let worker = InvalidationWorker::new(engine, rx).spawn();
        Self { listener, worker }
    }

    pub fn abort(&self) {
        self.listener.abort();
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MergeCache;
    use depot_cache::{CacheHandle, MemoryCache, MemoryCacheOptions};
    use depot_storage::{EventBus, MemoryStore, StoreKey};
    use std::time::Duration;

    const PATH: &str = "org/foo/bar/maven-metadata.xml";

    fn path() -> ContentPath {
        ContentPath::parse(PATH).unwrap()
    }

    fn group(name: &str, members: impl IntoIterator<Item = StoreKey>) -> GroupDefinition {
        GroupDefinition::new(StoreKey::group(name), members).unwrap()
    }

    /// `outer` contains `inner` contains `hosted:a`; `other` contains `hosted:b`.
    fn registry() -> Arc<StoreRegistry> {
        let registry = Arc::new(StoreRegistry::default());
        for name in ["a", "b"] {
            let store = MemoryStore::with_files(StoreKey::hosted(name), [(PATH, "<metadata/>")]);
            registry.add_store(Arc::new(store)).unwrap();
        }
        registry.update_group(group("inner", [StoreKey::hosted("a")]));
        registry.update_group(group("outer", [StoreKey::group("inner"), StoreKey::hosted("b")]));
        registry.update_group(group("other", [StoreKey::hosted("b")]));
        registry
    }

    fn listener(registry: &Arc<StoreRegistry>) -> (ChangeListener, mpsc::Receiver<Invalidation>) {
        let (tx, rx) = mpsc::channel(16);
        (ChangeListener::new(Arc::clone(registry), tx), rx)
    }

    fn engine(registry: &Arc<StoreRegistry>) -> Arc<MergeEngine> {
        let cache: Arc<MemoryCache<crate::MergeKey, Arc<crate::MergedDocument>>> =
            Arc::new(MemoryCache::new("merge", MemoryCacheOptions::default()));
        let handle: Arc<MergeCache> = Arc::new(CacheHandle::new("merge", cache));
        Arc::new(MergeEngine::new(Arc::clone(registry), handle))
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_content_change_reaches_nested_groups() {
        let registry = registry();
        let (listener, _rx) = listener(&registry);
        let event = StoreEvent::ContentChanged { store: StoreKey::hosted("a"), path: path() };
        let groups: Vec<_> = listener
            .invalidations_for(&event)
            .into_iter()
            .map(|command| match command {
                Invalidation::Path { group, path: changed } => {
                    assert_eq!(changed, path());
                    group.key().clone()
                },
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(groups, [StoreKey::group("inner"), StoreKey::group("outer")]);
    }

    #[test]
    fn test_content_change_outside_any_group() {
        let registry = registry();
        let (listener, _rx) = listener(&registry);
        let event = StoreEvent::ContentChanged { store: StoreKey::hosted("loner"), path: path() };
        assert!(listener.invalidations_for(&event).is_empty());
    }

    #[test]
    fn test_membership_change_reaches_containing_groups() {
        let registry = registry();
        let (listener, _rx) = listener(&registry);
        let inner = registry.group(&StoreKey::group("inner")).unwrap();
        let commands = listener.invalidations_for(&StoreEvent::MembershipChanged { group: inner.clone() });
        let outer = registry.group(&StoreKey::group("outer")).unwrap();
        assert_eq!(commands, [Invalidation::Group { group: inner }, Invalidation::Group { group: outer }]);
    }

    #[tokio::test]
    async fn test_listener_forwards_registry_events() {
        let registry = registry();
        let (listener, mut rx) = listener(&registry);
        let task = listener.spawn();
        registry.put(&StoreKey::hosted("b"), &path(), b"<metadata/>").await.unwrap();
        let mut groups = vec![];
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Invalidation::Path { group, .. } => groups.push(group.key().clone()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(groups, [StoreKey::group("other"), StoreKey::group("outer")]);
        drop(rx);
        // The next forwarded command finds the worker gone and the listener exits.
        registry.put(&StoreKey::hosted("b"), &path(), b"<metadata/>").await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_listener_invalidates_everything() {
        let registry = Arc::new(StoreRegistry::new(EventBus::new(1)));
        registry.add_store(Arc::new(MemoryStore::new(StoreKey::hosted("a")))).unwrap();
        let (listener, mut rx) = listener(&registry);
        for _ in 0..3 {
            registry.put(&StoreKey::hosted("a"), &path(), b"x").await.unwrap();
        }
        listener.spawn();
        assert_eq!(rx.recv().await.unwrap(), Invalidation::All);
    }

    #[tokio::test]
    async fn test_nested_content_change_evicts_outer_group() {
        let registry = registry();
        let engine = engine(&registry);
        let tasks = InvalidationTasks::spawn(Arc::clone(&engine), DEFAULT_INVALIDATION_BUFFER);
        let outer = registry.group(&StoreKey::group("outer")).unwrap();
        engine.read(&outer, &path()).await.unwrap().unwrap();
        let key = (StoreKey::group("outer"), path());
        assert!(engine.cache().contains_key(&key));

        registry.put(&StoreKey::hosted("a"), &path(), b"<metadata><version>2</version></metadata>").await.unwrap();
        eventually(|| !engine.cache().contains_key(&key)).await;
        eventually(|| !engine.cache().contains_key(&(StoreKey::group("inner"), path()))).await;
        tasks.abort();
    }

    #[tokio::test]
    async fn test_removed_group_is_evicted() {
        let registry = registry();
        let engine = engine(&registry);
        let tasks = InvalidationTasks::spawn(Arc::clone(&engine), DEFAULT_INVALIDATION_BUFFER);
        let other = registry.group(&StoreKey::group("other")).unwrap();
        engine.read(&other, &path()).await.unwrap().unwrap();
        registry.remove_group(&StoreKey::group("other"));
        eventually(|| engine.cache().keys_matching(|_| true).is_empty()).await;
        tasks.abort();
    }

    #[tokio::test]
    async fn test_invalidate_all_command() {
        let registry = registry();
        let engine = engine(&registry);
        for name in ["inner", "outer", "other"] {
            let group = registry.group(&StoreKey::group(name)).unwrap();
            engine.read(&group, &path()).await.unwrap();
        }
        assert_eq!(engine.cache().keys_matching(|_| true).len(), 3);
        InvalidationWorker::apply(&engine, &Invalidation::All).await.unwrap();
        assert!(engine.cache().keys_matching(|_| true).is_empty());
    }
}
