//! Transactional caching for depot.
//!
//! A [`Cache`] is a key/value store with thread-bound transactions and
//! pessimistic key locks; [`MemoryCache`] is the in-process implementation.
//! Application code never holds a cache directly. It goes through a
//! [`CacheHandle`], which meters every call, refuses work once stopped, and
//! turns ordinary cache failures into "no result".

pub mod error;
mod handle;
mod memory;
pub mod metrics;
mod traits;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::handle::{CacheHandle, DEFAULT_METRIC_PREFIX};
pub use crate::memory::{DEFAULT_LOCK_TIMEOUT, MemoryCache, MemoryCacheOptions};
pub use crate::metrics::{FacadeMetrics, MemoryMetrics, MetricsRecorder, NoopMetrics};
pub use crate::traits::{Cache, LockManager, TransactionId, TransactionManager, TransactionStatus};
