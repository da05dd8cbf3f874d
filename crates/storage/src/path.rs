//! Content path validation.
//!
//! Every path handed to a store or used as part of a cache key goes through
//! [`ContentPath::parse`], so two spellings of the same location can never
//! end up as two different cache entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

use crate::error::{Error, ErrorKind, Result};

/// Validates a storage path for security and correctness, returning its
/// normalized, slash-separated form.
///
/// Ensures that paths don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes or case. Null bytes
/// >           are explicitly rejected.
///
/// # Examples
///
/// ```
/// use depot_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("org/foo/bar/maven-metadata.xml").is_ok());
/// assert!(validate_path("a/../file.pom").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("/wrong/../still-wrong/.././correct//./path.pom/").unwrap(),
///     "correct/path.pom"
/// );
/// ```
pub fn validate(path: impl AsRef<str>) -> Result<String> {
    let raw = path.as_ref();
    let invalid = || Error::from(ErrorKind::InvalidPath(raw.to_string()));
    let mut components: Vec<&str> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    return Err(invalid());
                }
                components.push(s.to_str().ok_or_else(invalid)?);
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => return Err(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    return Err(invalid());
                }
            },
        }
    }
    match components.is_empty() {
        true => Err(invalid()),
        false => Ok(components.join("/")),
    }
}

/// A normalized, slash-separated, relative path into a content store.
///
/// Never empty, never starts with a slash, and compares case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentPath(String);
impl ContentPath {
    pub fn parse(path: impl AsRef<str>) -> Result<Self> {
        validate(path).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns `true` if `prefix` matches this path component-wise
    /// (`"a/b"` is a prefix of `"a/b/c"` but not of `"a/bc"`).
    pub fn starts_with(&self, prefix: &ContentPath) -> bool {
        Path::new(&self.0).starts_with(&prefix.0)
    }

    /// Prepend a directory to this path.
    pub fn under(&self, dir: impl AsRef<str>) -> Result<Self> {
        Self::parse(format!("{}/{}", dir.as_ref(), self.0))
    }

    /// Strip a leading directory from this path, if it is there and something
    /// remains afterwards.
    pub fn strip_prefix(&self, dir: &ContentPath) -> Option<Self> {
        let rest = Path::new(&self.0).strip_prefix(&dir.0).ok()?;
        Self::parse(rest.to_str()?).ok()
    }
}
impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl AsRef<Path> for ContentPath {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}
impl TryFrom<String> for ContentPath {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}
impl TryFrom<&str> for ContentPath {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}
impl From<ContentPath> for String {
    fn from(path: ContentPath) -> Self {
        path.0
    }
}
