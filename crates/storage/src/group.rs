use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::key::StoreKey;

/// A group store and its ordered list of constituents.
///
/// Constituent order is merge precedence: earlier stores win ties. Reordering
/// without changing membership is still a change that invalidates every merge
/// cached for the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDefinition {
    key: StoreKey,
    constituents: Vec<StoreKey>,
}
impl GroupDefinition {
    /// Returns [`InvalidKey`](ErrorKind::InvalidKey) if `key` is not a group
    /// key, or if the group lists itself.
    pub fn new(key: StoreKey, constituents: impl IntoIterator<Item = StoreKey>) -> Result<Self> {
        if !key.is_group() {
            exn::bail!(ErrorKind::InvalidKey(key.to_string()));
        }
        let mut group = Self { key, constituents: Vec::new() };
        for constituent in constituents {
            group.add_constituent(constituent)?;
        }
        Ok(group)
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn constituents(&self) -> &[StoreKey] {
        &self.constituents
    }

    pub fn contains(&self, store: &StoreKey) -> bool {
        self.constituents.contains(store)
    }

    /// Append a constituent at the lowest precedence. Adding a store that is
    /// already a member is a no-op and returns `false`.
    pub fn add_constituent(&mut self, store: StoreKey) -> Result<bool> {
        if store == self.key {
            exn::bail!(ErrorKind::InvalidKey(store.to_string()));
        }
        if self.contains(&store) {
            return Ok(false);
        }
        self.constituents.push(store);
        Ok(true)
    }

    /// Returns `false` if the store was not a member.
    pub fn remove_constituent(&mut self, store: &StoreKey) -> bool {
        let before = self.constituents.len();
        self.constituents.retain(|c| c != store);
        before != self.constituents.len()
    }
}
