//! Config Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An explicitly requested config file does not exist.
    #[display("config file not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The file extension is not one of toml, yaml, yml or json.
    #[display("unsupported config format: {_0}")]
    UnsupportedFormat(#[error(not(source))] String),
    /// A source could not be parsed, or a value has the wrong type.
    #[display("failed to load configuration")]
    Load,
    #[display("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed, i.e. the file may yet appear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
