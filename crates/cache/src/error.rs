//! Cache Error Types
//!
//! Two families live here. Ordinary cache failures ([`Closed`](ErrorKind::Closed),
//! [`LockTimeout`](ErrorKind::LockTimeout), [`Operation`](ErrorKind::Operation))
//! are logged and swallowed by the [`CacheHandle`](crate::CacheHandle). The
//! transaction failures are the ones a caller has to see, because they mean
//! the unit of work it thought it committed did not happen.

use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The cache has been closed and holds nothing any more.
    #[display("cache is closed")]
    Closed,
    /// Another transaction held a key lock for longer than the lock timeout.
    #[display("timed out waiting for lock on {_0}")]
    LockTimeout(#[error(not(source))] String),
    /// Any other failure of a cache operation.
    #[display("cache operation failed: {_0}")]
    Operation(#[error(not(source))] String),
    /// The transaction manager refused the request (nested transactions).
    #[display("transaction not supported: {_0}")]
    NotSupported(#[error(not(source))] String),
    /// The transaction manager is in a state where the request makes no sense,
    /// such as committing when no transaction is active.
    #[display("transaction system error: {_0}")]
    System(#[error(not(source))] String),
    /// The transaction was rolled back instead of committed.
    #[display("transaction rolled back: {_0}")]
    Rollback(#[error(not(source))] String),
    /// Some writes were committed and some were rolled back.
    #[display("transaction partially committed: {_0}")]
    HeuristicMixed(#[error(not(source))] String),
    /// Every write was rolled back by a heuristic decision.
    #[display("transaction heuristically rolled back: {_0}")]
    HeuristicRollback(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }

    /// Returns `true` for failures that belong to the transaction protocol and
    /// must therefore reach the caller instead of being swallowed.
    pub fn is_transaction_failure(&self) -> bool {
        matches!(
            self,
            Self::NotSupported(_)
                | Self::System(_)
                | Self::Rollback(_)
                | Self::HeuristicMixed(_)
                | Self::HeuristicRollback(_)
        )
    }
}
