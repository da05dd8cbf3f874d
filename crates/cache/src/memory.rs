//! In-process transactional cache.
//!
//! [`MemoryCache`] keeps committed entries in a map behind a single mutex.
//! Transactions buffer their writes and only apply them on commit, and every
//! key a transaction writes (or explicitly [`lock`](Cache::lock)s) stays locked
//! until the transaction ends. Lock waiters park on a condition variable that
//! is signalled whenever locks are released.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, Result};
use crate::traits::{Cache, LockManager, TransactionId, TransactionManager, TransactionStatus};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheOptions {
    /// Evict the oldest unlocked entries once the cache holds more than this.
    pub max_entries: Option<usize>,
    /// Entries expire this long after they were written.
    pub ttl: Option<Duration>,
    /// How long a writer waits for another transaction's key lock.
    pub lock_timeout: Duration,
}
impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self { max_entries: None, ttl: None, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}

struct Entry<V> {
    value: V,
    sequence: u64,
    expires_at: Option<Instant>,
}
impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct Transaction<K, V> {
    id: TransactionId,
    status: TransactionStatus,
    /// `None` records a removal.
    writes: HashMap<K, Option<V>>,
    /// Keys in first-write order, so commits apply deterministically.
    order: Vec<K>,
    locks: Vec<K>,
}
impl<K: Eq + Hash + Clone, V> Transaction<K, V> {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            status: TransactionStatus::Active,
            writes: HashMap::new(),
            order: Vec::new(),
            locks: Vec::new(),
        }
    }

    fn record(&mut self, key: K, write: Option<V>) {
        if self.writes.insert(key.clone(), write).is_none() {
            self.order.push(key);
        }
    }
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    locks: HashMap<K, TransactionId>,
    transactions: HashMap<ThreadId, Transaction<K, V>>,
    sequence: u64,
    closed: bool,
}
impl<K: Eq + Hash + Clone, V: Clone> State<K, V> {
    fn committed(&mut self, key: &K, now: Instant) -> Option<&V> {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// The value `thread` sees: its own uncommitted write if it has one.
    fn visible(&mut self, thread: ThreadId, key: &K) -> Option<V> {
        if let Some(write) = self.transactions.get(&thread).and_then(|tx| tx.writes.get(key)) {
            return write.clone();
        }
        self.committed(key, Instant::now()).cloned()
    }

    /// Buffer the write in the thread's transaction, or apply it immediately.
    fn store(&mut self, thread: ThreadId, key: K, write: Option<V>, options: &MemoryCacheOptions) {
        match self.transactions.get_mut(&thread) {
            Some(tx) => tx.record(key, write),
            None => self.apply(key, write, options),
        }
    }

    fn apply(&mut self, key: K, write: Option<V>, options: &MemoryCacheOptions) {
        let Some(value) = write else {
            self.entries.remove(&key);
            return;
        };
        self.sequence += 1;
        let expires_at = options.ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.clone(), Entry { value, sequence: self.sequence, expires_at });
        let Some(max_entries) = options.max_entries else {
            return;
        };
        while self.entries.len() > max_entries {
            let oldest = self
                .entries
                .iter()
                .filter(|(candidate, _)| **candidate != key && !self.locks.contains_key(*candidate))
                .min_by_key(|(_, entry)| entry.sequence)
                .map(|(candidate, _)| candidate.clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::trace!("Evicted oldest cache entry");
        }
    }

    fn release(&mut self, keys: &[K]) {
        for key in keys {
            self.locks.remove(key);
        }
    }
}

/// A bounded, expiring, transactional in-memory cache.
///
/// Transactions are bound to the thread that began them; see
/// [`TransactionManager`]. Closures passed to
/// [`compute_if_absent`](Cache::compute_if_absent) run while the cache's
/// internal mutex is held and must not call back into the cache.
pub struct MemoryCache<K, V> {
    name: String,
    options: MemoryCacheOptions,
    state: Mutex<State<K, V>>,
    released: Condvar,
    next_transaction: AtomicU64,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(name: impl Into<String>, options: MemoryCacheOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(State {
                entries: HashMap::new(),
                locks: HashMap::new(),
                transactions: HashMap::new(),
                sequence: 0,
                closed: false,
            }),
            released: Condvar::new(),
            next_transaction: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &MemoryCacheOptions {
        &self.options
    }

    /// Number of committed, unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state.lock().entries.values().filter(|entry| entry.is_live(now)).count()
    }

    /// Drop every entry, lock and open transaction. Every later call fails
    /// with [`Closed`](ErrorKind::Closed), and so do calls waiting on a lock.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.clear();
            state.locks.clear();
            state.transactions.clear();
        }
        self.released.notify_all();
        tracing::info!(cache = %self.name, "Closed cache");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn open(&self) -> Result<MutexGuard<'_, State<K, V>>> {
        let state = self.state.lock();
        if state.closed {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(state)
    }

    /// Wait until `key` is free or already owned by the thread's transaction.
    ///
    /// Inside a transaction the lock is then taken and held until the
    /// transaction ends. A transaction that times out is marked rollback-only.
    fn acquire(&self, state: &mut MutexGuard<'_, State<K, V>>, thread: ThreadId, key: &K) -> Result<()> {
        let owner = state.transactions.get(&thread).map(|tx| tx.id);
        let deadline = Instant::now() + self.options.lock_timeout;
        loop {
            if state.closed {
                exn::bail!(ErrorKind::Closed);
            }
            match state.locks.get(key).copied() {
                Some(holder) if Some(holder) == owner => return Ok(()),
                Some(holder) => {
                    if Instant::now() >= deadline {
                        if let Some(tx) = state.transactions.get_mut(&thread) {
                            tx.status = TransactionStatus::MarkedRollback;
                        }
                        tracing::warn!(cache = %self.name, %holder, "Timed out waiting for key lock");
                        exn::bail!(ErrorKind::LockTimeout(format!("{key:?}")));
                    }
                    self.released.wait_until(state, deadline);
                },
                None => {
                    if let Some(id) = owner {
                        state.locks.insert(key.clone(), id);
                        if let Some(tx) = state.transactions.get_mut(&thread) {
                            tx.locks.push(key.clone());
                        }
                    }
                    return Ok(());
                },
            }
        }
    }

    fn write(&self, key: K, write: Option<V>) -> Result<Option<V>> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        self.acquire(&mut state, thread, &key)?;
        let previous = state.visible(thread, &key);
        state.store(thread, key, write, &self.options);
        Ok(previous)
    }

    /// End the thread's transaction, applying its writes if `apply` is set.
    fn finish(&self, apply: bool) -> Result<Transaction<K, V>> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        let Some(mut tx) = state.transactions.remove(&thread) else {
            exn::bail!(ErrorKind::System("no transaction is associated with the current thread".to_string()));
        };
        if apply && tx.status == TransactionStatus::Active {
            for key in std::mem::take(&mut tx.order) {
                if let Some(write) = tx.writes.remove(&key) {
                    state.apply(key, write, &self.options);
                }
            }
        }
        state.release(&tx.locks);
        drop(state);
        self.released.notify_all();
        Ok(tx)
    }
}

impl<K, V> TransactionManager for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn begin(&self) -> Result<()> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        if let Some(tx) = state.transactions.get(&thread) {
            exn::bail!(ErrorKind::NotSupported(format!("{} is already active on this thread", tx.id)));
        }
        let id = TransactionId(self.next_transaction.fetch_add(1, Ordering::Relaxed));
        state.transactions.insert(thread, Transaction::new(id));
        tracing::trace!(cache = %self.name, transaction = %id, "Began transaction");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let tx = self.finish(true)?;
        if tx.status == TransactionStatus::MarkedRollback {
            exn::bail!(ErrorKind::Rollback(format!("{} was marked rollback-only", tx.id)));
        }
        tracing::trace!(cache = %self.name, transaction = %tx.id, "Committed transaction");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let tx = self.finish(false)?;
        tracing::trace!(cache = %self.name, transaction = %tx.id, "Rolled back transaction");
        Ok(())
    }

    fn set_rollback_only(&self) -> Result<()> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        let Some(tx) = state.transactions.get_mut(&thread) else {
            exn::bail!(ErrorKind::System("no transaction is associated with the current thread".to_string()));
        };
        tx.status = TransactionStatus::MarkedRollback;
        Ok(())
    }

    fn status(&self) -> Result<TransactionStatus> {
        let thread = thread::current().id();
        let state = self.open()?;
        Ok(state.transactions.get(&thread).map_or(TransactionStatus::NoTransaction, |tx| tx.status))
    }
}

impl<K, V> LockManager<K> for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn owner(&self, key: &K) -> Result<Option<TransactionId>> {
        Ok(self.open()?.locks.get(key).copied())
    }

    fn is_locked(&self, key: &K) -> Result<bool> {
        Ok(self.open()?.locks.contains_key(key))
    }
}

impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        let thread = thread::current().id();
        Ok(self.open()?.visible(thread, key))
    }

    fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.write(key, Some(value))
    }

    fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        self.acquire(&mut state, thread, &key)?;
        if let Some(existing) = state.visible(thread, &key) {
            return Ok(Some(existing));
        }
        state.store(thread, key, Some(value), &self.options);
        Ok(None)
    }

    fn compute_if_absent(&self, key: K, compute: &mut dyn FnMut(&K) -> Option<V>) -> Result<Option<V>> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        self.acquire(&mut state, thread, &key)?;
        if let Some(existing) = state.visible(thread, &key) {
            return Ok(Some(existing));
        }
        let Some(value) = compute(&key) else {
            return Ok(None);
        };
        state.store(thread, key, Some(value.clone()), &self.options);
        Ok(Some(value))
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        self.write(key.clone(), None)
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        let thread = thread::current().id();
        Ok(self.open()?.visible(thread, key).is_some())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.keys()?.is_empty())
    }

    fn keys(&self) -> Result<Vec<K>> {
        let thread = thread::current().id();
        let now = Instant::now();
        let mut state = self.open()?;
        state.entries.retain(|_, entry| entry.is_live(now));
        let mut keys: HashSet<K> = state.entries.keys().cloned().collect();
        if let Some(tx) = state.transactions.get(&thread) {
            for (key, write) in &tx.writes {
                match write {
                    Some(_) => keys.insert(key.clone()),
                    None => keys.remove(key),
                };
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn lock(&self, keys: &[K]) -> Result<bool> {
        let thread = thread::current().id();
        let mut state = self.open()?;
        if !state.transactions.contains_key(&thread) {
            exn::bail!(ErrorKind::Operation("locking keys requires an active transaction".to_string()));
        }
        for key in keys {
            self.acquire(&mut state, thread, key)?;
        }
        Ok(true)
    }

    fn transaction_manager(&self) -> &dyn TransactionManager {
        self
    }

    fn lock_manager(&self) -> &dyn LockManager<K> {
        self
    }
}
