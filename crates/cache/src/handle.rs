//! The one door into a cache.
//!
//! [`CacheHandle`] wraps a [`Cache`] so that nothing else in the process
//! touches it directly. Every call is counted and timed, and every call checks
//! the handle's stopped flag first. Ordinary cache failures are logged and
//! reported as "no result" instead of being raised; only transaction failures
//! reach the caller, since swallowing those would hide lost writes.

use std::collections::HashSet;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, ErrorKind, Result};
use crate::metrics::{METER, MetricsRecorder, NoopMetrics, TIMER, metric_name};
use crate::traits::{Cache, TransactionId, TransactionManager, TransactionStatus};

pub const DEFAULT_METRIC_PREFIX: &str = "depot.cache";

enum Outcome<R> {
    Done(R),
    Failed(Error),
    Stopped,
}

pub struct CacheHandle<K, V> {
    name: String,
    cache: Arc<dyn Cache<K, V>>,
    metrics: Arc<dyn MetricsRecorder>,
    metric_prefix: String,
    stopped: AtomicBool,
}

impl<K, V> CacheHandle<K, V> {
    pub fn new(name: impl Into<String>, cache: Arc<dyn Cache<K, V>>) -> Self {
        Self {
            name: name.into(),
            cache,
            metrics: Arc::new(NoopMetrics),
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>, prefix: impl Into<String>) -> Self {
        self.metrics = metrics;
        self.metric_prefix = prefix.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped cache, for the owner that has to close it. Everything else
    /// goes through the handle.
    pub fn cache(&self) -> &Arc<dyn Cache<K, V>> {
        &self.cache
    }

    /// Refuse every later operation. Idempotent; only the first call logs.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::info!(cache = %self.name, "Cache is shutting down");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn run<R>(&self, operation: &str, f: impl FnOnce(&dyn Cache<K, V>) -> Result<R>) -> Outcome<R> {
        self.metrics.increment(&metric_name(&self.metric_prefix, operation, METER));
        let _timer = self.metrics.start_timer(metric_name(&self.metric_prefix, operation, TIMER));
        if self.is_stopped() {
            tracing::error!(cache = %self.name, operation, "Cannot complete operation, cache is shutting down");
            return Outcome::Stopped;
        }
        match catch_unwind(AssertUnwindSafe(|| f(self.cache.as_ref()))) {
            Ok(Ok(result)) => Outcome::Done(result),
            Ok(Err(err)) => Outcome::Failed(err),
            Err(_) => Outcome::Failed(exn::Exn::from(ErrorKind::Operation(format!("{operation} panicked")))),
        }
    }

    fn execute_named<R>(&self, operation: &str, f: impl FnOnce(&dyn Cache<K, V>) -> Result<R>) -> Option<R> {
        match self.run(operation, f) {
            Outcome::Done(result) => Some(result),
            Outcome::Failed(err) => {
                tracing::error!(cache = %self.name, operation, error = ?err, "Failed to complete cache operation");
                None
            },
            Outcome::Stopped => None,
        }
    }

    /// Run an arbitrary operation against the cache.
    ///
    /// Returns `None` when the handle is stopped or the operation failed; the
    /// failure is logged, never raised.
    pub fn execute<R>(&self, f: impl FnOnce(&dyn Cache<K, V>) -> Result<R>) -> Option<R> {
        self.execute_named("execute", f)
    }

    fn transaction<R>(&self, operation: &str, f: impl FnOnce(&dyn TransactionManager) -> Result<R>) -> Result<Option<R>> {
        match self.run(operation, |cache| f(cache.transaction_manager())) {
            Outcome::Done(result) => Ok(Some(result)),
            Outcome::Failed(err) if err.is_transaction_failure() => {
                tracing::warn!(cache = %self.name, operation, error = ?err, "Transaction failed");
                Err(err)
            },
            Outcome::Failed(err) => {
                tracing::error!(cache = %self.name, operation, error = ?err, "Failed to complete cache operation");
                Ok(None)
            },
            Outcome::Stopped => Ok(None),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================
    //
    // `Ok(None)` means the handle is stopped or the cache itself is unusable;
    // transaction protocol failures are returned as errors.

    pub fn begin_transaction(&self) -> Result<Option<()>> {
        self.transaction("begin_transaction", |tm| tm.begin())
    }

    pub fn commit(&self) -> Result<Option<()>> {
        self.transaction("commit", |tm| tm.commit())
    }

    pub fn rollback(&self) -> Result<Option<()>> {
        self.transaction("rollback", |tm| tm.rollback())
    }

    pub fn set_rollback_only(&self) -> Result<Option<()>> {
        self.transaction("set_rollback_only", |tm| tm.set_rollback_only())
    }

    pub fn transaction_status(&self) -> Result<Option<TransactionStatus>> {
        self.transaction("transaction_status", |tm| tm.status())
    }

    // =========================================================================
    // Entries
    // =========================================================================

    pub fn get(&self, key: &K) -> Option<V> {
        self.execute_named("get", |cache| cache.get(key)).flatten()
    }

    /// Returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.execute_named("put", |cache| cache.put(key, value)).flatten()
    }

    /// Returns the existing value, or `None` if `value` was stored (or the
    /// call failed).
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        self.execute_named("put_if_absent", |cache| cache.put_if_absent(key, value)).flatten()
    }

    pub fn compute_if_absent(&self, key: K, compute: impl FnOnce(&K) -> Option<V>) -> Option<V> {
        let mut compute = Some(compute);
        self.execute_named("compute_if_absent", |cache| {
            cache.compute_if_absent(key, &mut |key: &K| compute.take().and_then(|f| f(key)))
        })
        .flatten()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.execute_named("remove", |cache| cache.remove(key)).flatten()
    }

    /// `false` when the handle is stopped.
    pub fn contains_key(&self, key: &K) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.execute_named("contains_key", |cache| cache.contains_key(key)).unwrap_or(false)
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.execute_named("is_empty", |cache| cache.is_empty())
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn lock_owner(&self, key: &K) -> Option<TransactionId> {
        self.execute_named("lock_owner", |cache| cache.lock_manager().owner(key)).flatten()
    }

    pub fn is_locked(&self, key: &K) -> Option<bool> {
        self.execute_named("is_locked", |cache| cache.lock_manager().is_locked(key))
    }

    /// Lock `keys` for the current transaction.
    pub fn lock(&self, keys: &[K]) -> Option<bool> {
        self.execute_named("lock", |cache| cache.lock(keys))
    }
}

impl<K: Eq + Hash, V> CacheHandle<K, V> {
    /// Every key accepted by `predicate`. Scans the whole cache.
    pub fn keys_matching(&self, predicate: impl Fn(&K) -> bool) -> HashSet<K> {
        self.execute_named("keys_matching", |cache| {
            Ok(cache.keys()?.into_iter().filter(|key| predicate(key)).collect())
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCache, MemoryCacheOptions};
    use crate::metrics::MemoryMetrics;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        cache: Arc<MemoryCache<String, u32>>,
        metrics: Arc<MemoryMetrics>,
        handle: CacheHandle<String, u32>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(MemoryCache::new(
            "test",
            MemoryCacheOptions { lock_timeout: Duration::from_millis(20), ..Default::default() },
        ));
        let metrics = Arc::new(MemoryMetrics::default());
        let handle = CacheHandle::new("test", cache.clone() as Arc<dyn Cache<String, u32>>)
            .with_metrics(metrics.clone(), "depot.cache");
        Fixture { cache, metrics, handle }
    }

    fn key(k: &str) -> String {
        k.to_string()
    }

    #[test]
    fn test_operations_are_metered_and_timed() {
        let f = fixture();
        f.handle.put(key("a"), 1);
        f.handle.get(&key("a"));
        f.handle.get(&key("missing"));
        assert_eq!(f.metrics.count("depot.cache.put.meter"), 1);
        assert_eq!(f.metrics.timings("depot.cache.put.timer").len(), 1);
        assert_eq!(f.metrics.count("depot.cache.get.meter"), 2);
        assert_eq!(f.metrics.timings("depot.cache.get.timer").len(), 2);
    }

    #[test]
    fn test_stopped_handle_does_nothing() {
        let f = fixture();
        f.handle.put(key("a"), 1);
        f.handle.stop();
        f.handle.stop();
        assert!(f.handle.is_stopped());
        assert_eq!(f.handle.get(&key("a")), None);
        assert_eq!(f.handle.put(key("b"), 2), None);
        assert!(!f.handle.contains_key(&key("a")));
        assert_eq!(f.handle.begin_transaction().unwrap(), None);
        assert_eq!(f.handle.transaction_status().unwrap(), None);
        // The cache itself was never reached.
        assert_eq!(f.cache.get(&key("b")).unwrap(), None);
        assert_eq!(f.cache.get(&key("a")).unwrap(), Some(1));
    }

    #[test]
    fn test_stop_while_in_use() {
        let f = fixture();
        thread::scope(|s| {
            for worker in 0..4u32 {
                let handle = &f.handle;
                s.spawn(move || {
                    let mine = format!("worker-{worker}");
                    let mut after_stop = 0;
                    while after_stop < 50 {
                        if handle.is_stopped() {
                            after_stop += 1;
                        }
                        handle.put(mine.clone(), worker);
                        handle.get(&mine);
                        if handle.begin_transaction().unwrap().is_some() {
                            handle.put(mine.clone(), worker + 1);
                            // A stop between begin and commit leaves the commit undone.
                            handle.commit().unwrap();
                        }
                    }
                });
            }
            s.spawn(|| {
                thread::sleep(Duration::from_millis(5));
                for _ in 0..10 {
                    f.handle.stop();
                }
            });
        });
        assert!(f.handle.is_stopped());
        assert_eq!(f.handle.get(&key("worker-0")), None);
        assert_eq!(f.handle.put(key("late"), 1), None);
        assert!(!f.handle.contains_key(&key("worker-0")));
        assert_eq!(f.handle.begin_transaction().unwrap(), None);
        assert_eq!(f.handle.commit().unwrap(), None);
        assert_eq!(f.cache.get(&key("late")).unwrap(), None);
    }

    #[test]
    fn test_ordinary_failures_are_swallowed() {
        let f = fixture();
        f.cache.close();
        assert_eq!(f.handle.get(&key("a")), None);
        assert_eq!(f.handle.put(key("a"), 1), None);
        assert_eq!(f.handle.is_empty(), None);
        assert!(f.handle.keys_matching(|_| true).is_empty());
        // Transaction calls against a closed cache: no result, no error.
        assert_eq!(f.handle.begin_transaction().unwrap(), None);
        assert_eq!(f.metrics.count("depot.cache.get.meter"), 1);
    }

    #[test]
    fn test_transaction_failures_are_raised() {
        let f = fixture();
        let err = f.handle.commit().unwrap_err();
        assert!(matches!(&*err, ErrorKind::System(_)));

        f.handle.begin_transaction().unwrap().unwrap();
        let err = f.handle.begin_transaction().unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotSupported(_)));

        f.handle.put(key("a"), 1);
        f.handle.set_rollback_only().unwrap().unwrap();
        let err = f.handle.commit().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Rollback(_)));
        assert_eq!(f.handle.get(&key("a")), None);
    }

    #[test]
    fn test_transaction_round_trip() {
        let f = fixture();
        assert_eq!(f.handle.transaction_status().unwrap(), Some(TransactionStatus::NoTransaction));
        f.handle.begin_transaction().unwrap().unwrap();
        assert_eq!(f.handle.transaction_status().unwrap(), Some(TransactionStatus::Active));
        assert_eq!(f.handle.lock(&[key("a")]), Some(true));
        assert!(f.handle.lock_owner(&key("a")).is_some());
        assert_eq!(f.handle.is_locked(&key("a")), Some(true));
        f.handle.put(key("a"), 1);
        f.handle.commit().unwrap().unwrap();
        assert_eq!(f.handle.is_locked(&key("a")), Some(false));
        assert_eq!(f.handle.get(&key("a")), Some(1));
    }

    #[test]
    fn test_lock_timeout_is_swallowed() {
        let f = fixture();
        f.handle.begin_transaction().unwrap().unwrap();
        f.handle.lock(&[key("a")]);
        thread::scope(|s| {
            s.spawn(|| assert_eq!(f.handle.put(key("a"), 1), None));
        });
        f.handle.rollback().unwrap().unwrap();
        assert_eq!(f.handle.get(&key("a")), None);
    }

    #[test]
    fn test_compute_if_absent() {
        let f = fixture();
        assert_eq!(f.handle.compute_if_absent(key("a"), |_| Some(3)), Some(3));
        assert_eq!(f.handle.compute_if_absent(key("a"), |_| panic!("already present")), Some(3));
        assert_eq!(f.handle.put_if_absent(key("a"), 4), Some(3));
        assert_eq!(f.handle.remove(&key("a")), Some(3));
        assert_eq!(f.handle.is_empty(), Some(true));
    }

    #[test]
    fn test_panicking_operation_is_swallowed() {
        let f = fixture();
        let result: Option<()> = f.handle.execute(|_| panic!("boom"));
        assert_eq!(result, None);
        assert_eq!(f.metrics.count("depot.cache.execute.meter"), 1);
    }

    #[test]
    fn test_keys_matching() {
        let f = fixture();
        for k in ["group:a", "group:b", "hosted:c"] {
            f.handle.put(key(k), 1);
        }
        let keys = f.handle.keys_matching(|k| k.starts_with("group:"));
        assert_eq!(keys, HashSet::from([key("group:a"), key("group:b")]));
    }
}
