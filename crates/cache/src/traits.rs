//! The cache contract the [`CacheHandle`](crate::CacheHandle) wraps.
//!
//! Everything is synchronous and returns [`Result`]: implementations report
//! failures, and the handle decides which of them the caller gets to see.

use derive_more::Display;

use crate::error::Result;

/// Identifies one transaction. Locks are owned by transactions.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("tx-{_0}")]
pub struct TransactionId(pub(crate) u64);

/// Lifecycle states of a transaction, as reported by
/// [`TransactionManager::status`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    #[display("active")]
    Active,
    /// Still open, but can only end in a rollback.
    #[display("marked rollback")]
    MarkedRollback,
    #[display("prepared")]
    Prepared,
    #[display("committed")]
    Committed,
    #[display("rolled back")]
    RolledBack,
    #[display("unknown")]
    Unknown,
    #[display("no transaction")]
    NoTransaction,
    #[display("preparing")]
    Preparing,
    #[display("committing")]
    Committing,
    #[display("rolling back")]
    RollingBack,
}

/// Transaction demarcation for a cache.
///
/// Transactions are bound to the calling thread: `begin` associates a new
/// transaction with the current thread and every cache call made from that
/// thread joins it until `commit` or `rollback`. In async code that means a
/// transaction must begin and end without an `.await` in between.
pub trait TransactionManager: Send + Sync {
    /// Fails with [`NotSupported`](crate::ErrorKind::NotSupported) if the
    /// thread already has a transaction.
    fn begin(&self) -> Result<()>;
    /// Apply every buffered write and release the transaction's locks. A
    /// transaction marked rollback-only is rolled back instead and the call
    /// fails with [`Rollback`](crate::ErrorKind::Rollback).
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
    fn set_rollback_only(&self) -> Result<()>;
    /// [`NoTransaction`](TransactionStatus::NoTransaction) when the thread has
    /// no transaction.
    fn status(&self) -> Result<TransactionStatus>;
}

/// Key lock introspection.
pub trait LockManager<K>: Send + Sync {
    fn owner(&self, key: &K) -> Result<Option<TransactionId>>;
    fn is_locked(&self, key: &K) -> Result<bool>;
}

/// A key/value cache with transactions and pessimistic key locks.
///
/// Writes made inside a transaction are invisible to other threads until the
/// transaction commits, and they lock the written key for the rest of the
/// transaction. Writes outside a transaction wait for any lock on the key.
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;
    /// Returns the previous value.
    fn put(&self, key: K, value: V) -> Result<Option<V>>;
    /// Store `value` only if the key has no value. Returns the existing value,
    /// or `None` if `value` was stored.
    fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>>;
    /// Return the key's value, computing and storing it first if absent. When
    /// `compute` yields `None` nothing is stored.
    fn compute_if_absent(&self, key: K, compute: &mut dyn FnMut(&K) -> Option<V>) -> Result<Option<V>>;
    /// Returns the removed value.
    fn remove(&self, key: &K) -> Result<Option<V>>;
    fn contains_key(&self, key: &K) -> Result<bool>;
    fn is_empty(&self) -> Result<bool>;
    /// Snapshot of every key with a value.
    fn keys(&self) -> Result<Vec<K>>;
    /// Acquire the locks on `keys` for the current transaction, waiting up to
    /// the lock timeout for each. Requires an active transaction.
    fn lock(&self, keys: &[K]) -> Result<bool>;
    fn transaction_manager(&self) -> &dyn TransactionManager;
    fn lock_manager(&self) -> &dyn LockManager<K>;
}
