//! Registry of stores and group definitions.
//!
//! The registry is the key-addressed face of storage: callers name a store by
//! [`StoreKey`] and the registry routes to the right [`ContentStore`], then
//! announces the change on the [`EventBus`]. Group definitions live here too,
//! since groups have no content of their own.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::instrument;

use crate::StoreHandle;
use crate::error::{ErrorKind, Result};
use crate::event::{EventBus, StoreEvent};
use crate::group::GroupDefinition;
use crate::key::StoreKey;
use crate::path::ContentPath;

pub struct StoreRegistry {
    stores: RwLock<HashMap<StoreKey, StoreHandle>>,
    groups: RwLock<HashMap<StoreKey, GroupDefinition>>,
    events: EventBus,
}

impl StoreRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =========================================================================
    // Stores
    // =========================================================================

    /// Register a hosted or remote store, replacing any store with the same key.
    pub fn add_store(&self, store: StoreHandle) -> Result<()> {
        let key = store.key().clone();
        if key.is_group() {
            exn::bail!(ErrorKind::InvalidKey(key.to_string()));
        }
        tracing::info!(store = %key, "Registered store");
        self.stores.write().insert(key, store);
        Ok(())
    }

    pub fn store(&self, key: &StoreKey) -> Option<StoreHandle> {
        self.stores.read().get(key).cloned()
    }

    fn require_store(&self, key: &StoreKey) -> Result<StoreHandle> {
        if key.is_group() {
            exn::bail!(ErrorKind::ReadOnly(key.to_string()));
        }
        self.store(key).ok_or_else(|| exn::Exn::from(ErrorKind::UnknownStore(key.to_string())))
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn group(&self, key: &StoreKey) -> Option<GroupDefinition> {
        self.groups.read().get(key).cloned()
    }

    pub fn groups(&self) -> Vec<GroupDefinition> {
        self.groups.read().values().cloned().collect()
    }

    /// Create or replace a group definition.
    ///
    /// Publishes [`MembershipChanged`](StoreEvent::MembershipChanged) unless the
    /// stored definition is identical (same constituents, same order). Returns
    /// whether anything changed.
    #[instrument(skip_all, fields(group = %group.key()))]
    pub fn update_group(&self, group: GroupDefinition) -> bool {
        {
            let mut groups = self.groups.write();
            if groups.get(group.key()) == Some(&group) {
                return false;
            }
            groups.insert(group.key().clone(), group.clone());
        }
        tracing::info!(constituents = group.constituents().len(), "Group membership changed");
        self.events.publish(StoreEvent::MembershipChanged { group });
        true
    }

    /// Delete a group definition, announcing it as a membership change so that
    /// everything derived from the group gets dropped.
    pub fn remove_group(&self, key: &StoreKey) -> Option<GroupDefinition> {
        let removed = self.groups.write().remove(key)?;
        tracing::info!(group = %key, "Group removed");
        self.events.publish(StoreEvent::MembershipChanged { group: removed.clone() });
        Some(removed)
    }

    /// Every group that includes `store`, directly or through nested groups.
    ///
    /// Results are ordered nearest first. Membership cycles are tolerated: each
    /// group is reported once.
    pub fn groups_containing(&self, store: &StoreKey) -> Vec<GroupDefinition> {
        let groups = self.groups.read();
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([store.clone()]);
        while let Some(member) = queue.pop_front() {
            let mut parents: Vec<&GroupDefinition> = groups.values().filter(|g| g.contains(&member)).collect();
            // HashMap iteration order is arbitrary; keep results deterministic.
            parents.sort_by(|a, b| a.key().cmp(b.key()));
            for parent in parents {
                if seen.insert(parent.key().clone()) {
                    queue.push_back(parent.key().clone());
                    found.push(parent.clone());
                }
            }
        }
        found
    }

    // =========================================================================
    // Content
    // =========================================================================

    pub async fn exists(&self, key: &StoreKey, path: &ContentPath) -> Result<bool> {
        self.require_store(key)?.exists(path).await
    }

    /// Read content, mapping "not found" to `None`. Any other failure is an error.
    pub async fn get(&self, key: &StoreKey, path: &ContentPath) -> Result<Option<Vec<u8>>> {
        match self.require_store(key)?.read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(store = %key, path = %path, bytes = data.len()))]
    pub async fn put(&self, key: &StoreKey, path: &ContentPath, data: &[u8]) -> Result<()> {
        self.require_store(key)?.write(path, data).await?;
        self.events.publish(StoreEvent::ContentChanged { store: key.clone(), path: path.clone() });
        Ok(())
    }

    /// Delete content. Deleting something that is already gone is not an error
    /// and publishes nothing.
    #[instrument(skip_all, fields(store = %key, path = %path))]
    pub async fn delete(&self, key: &StoreKey, path: &ContentPath) -> Result<()> {
        match self.require_store(key)?.delete(path).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        self.events.publish(StoreEvent::ContentChanged { store: key.clone(), path: path.clone() });
        Ok(())
    }
}
impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}
