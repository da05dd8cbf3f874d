//! Merge Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A merge error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Every kind is a reason a merge could not be produced; "nothing to merge" is
/// never an error.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A constituent document could not be parsed.
    #[display("malformed document from {store}: {reason}")]
    MalformedDocument {
        store: String,
        reason: String,
    },
    /// Fetching from a constituent failed for a reason other than absence.
    #[display("failed to fetch {path} from {store}")]
    Fetch {
        store: String,
        path: String,
    },
    /// The materialized copy of a merge could not be written or removed.
    #[display("materialization store error")]
    Materialize,
    /// The cache refused a transaction.
    #[display("merge cache transaction failed")]
    Cache,
    /// The recompute did not finish within the caller's deadline.
    #[display("merge timed out after {_0:?}")]
    Timeout(#[error(not(source))] std::time::Duration),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::Materialize | Self::Cache | Self::Timeout(_))
    }
}
