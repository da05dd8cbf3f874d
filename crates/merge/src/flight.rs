//! Single-flight recomputes.
//!
//! Concurrent reads of the same `(group, path)` share one in-flight cell:
//! the first reader initialises it, everyone else awaits the same outcome.
//! Cells leave the map once their readers are done, cancelled or not, so a later read
//! starts afresh (and normally finds the cache populated).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use depot_storage::StoreKey;

use crate::MergeKey;
use crate::document::MergedDocument;
use crate::error::ErrorKind;

/// What every reader of one flight observes.
pub(crate) type Outcome = std::result::Result<Option<Arc<MergedDocument>>, ErrorKind>;
pub(crate) type Flight = Arc<OnceCell<Outcome>>;

#[derive(Default)]
pub(crate) struct Flights {
    inflight: Mutex<HashMap<MergeKey, Flight>>,
}

impl Flights {
    /// The flight for `key`, joining the current one if there is one.
    pub(crate) fn join(&self, key: &MergeKey) -> Flight {
        Arc::clone(self.inflight.lock().entry(key.clone()).or_default())
    }

    /// Join the flight for `key` and land it when the returned guard drops,
    /// whether the reader finished or was cancelled.
    pub(crate) fn board(&self, key: MergeKey) -> Landing<'_> {
        let flight = self.join(&key);
        Landing { flights: self, key, flight }
    }

    /// Remove `flight` from the map, unless it has already been replaced.
    pub(crate) fn land(&self, key: &MergeKey, flight: &Flight) {
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
            inflight.remove(key);
        }
    }

    /// Detach the flight for `key`; readers arriving later start a new one.
    pub(crate) fn forget(&self, key: &MergeKey) {
        self.inflight.lock().remove(key);
    }

    pub(crate) fn forget_group(&self, group: &StoreKey) {
        self.inflight.lock().retain(|(key, _), _| key != group);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}

pub(crate) struct Landing<'a> {
    flights: &'a Flights,
    key: MergeKey,
    flight: Flight,
}

impl Landing<'_> {
    pub(crate) fn flight(&self) -> &Flight {
        &self.flight
    }
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        self.flights.land(&self.key, &self.flight);
    }
}
