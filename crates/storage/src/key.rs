//! Store identities.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// The three kinds of content store.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// Content is uploaded and owned by this store.
    #[display("hosted")]
    Hosted,
    /// Read-through proxy of an upstream repository.
    #[display("remote")]
    Remote,
    /// Virtual store merging an ordered list of other stores.
    #[display("group")]
    Group,
}
impl FromStr for StoreType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hosted" => Ok(Self::Hosted),
            "remote" => Ok(Self::Remote),
            "group" => Ok(Self::Group),
            other => exn::bail!(ErrorKind::InvalidKey(other.to_string())),
        }
    }
}

/// Immutable identity of a content store.
///
/// Displays (and parses) as `type:name`, e.g. `group:public`.
///
/// ```
/// use depot_storage::{StoreKey, StoreType};
///
/// let key: StoreKey = "remote:central".parse().unwrap();
/// assert_eq!(key, StoreKey::remote("central"));
/// assert_eq!(key.store_type, StoreType::Remote);
/// assert_eq!(key.to_string(), "remote:central");
/// ```
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display("{store_type}:{name}")]
pub struct StoreKey {
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub name: String,
}
impl StoreKey {
    pub fn new(store_type: StoreType, name: impl Into<String>) -> Self {
        Self { store_type, name: name.into() }
    }

    pub fn hosted(name: impl Into<String>) -> Self {
        Self::new(StoreType::Hosted, name)
    }

    pub fn remote(name: impl Into<String>) -> Self {
        Self::new(StoreType::Remote, name)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(StoreType::Group, name)
    }

    pub fn is_group(&self) -> bool {
        self.store_type == StoreType::Group
    }

    /// Directory under which content belonging to this store is persisted
    /// when several stores share one backing location: `<type>-<name>`.
    pub fn materialized_prefix(&self) -> String {
        format!("{}-{}", self.store_type, self.name)
    }
}
impl FromStr for StoreKey {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let Some((store_type, name)) = s.split_once(':') else {
            exn::bail!(ErrorKind::InvalidKey(s.to_string()));
        };
        if name.is_empty() || name.contains('/') {
            exn::bail!(ErrorKind::InvalidKey(s.to_string()));
        }
        Ok(Self::new(store_type.parse()?, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hosted:local", StoreKey::hosted("local"))]
    #[case("remote:central", StoreKey::remote("central"))]
    #[case("group:public", StoreKey::group("public"))]
    fn test_parse(#[case] input: &str, #[case] expected: StoreKey) {
        assert_eq!(input.parse::<StoreKey>().unwrap(), expected);
        assert_eq!(expected.to_string(), input);
    }

    #[rstest]
    #[case("local")]
    #[case("virtual:local")]
    #[case("hosted:")]
    #[case("hosted:a/b")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<StoreKey>().is_err());
    }

    #[test]
    fn test_ordering_is_field_wise() {
        assert!(StoreKey::hosted("z") < StoreKey::remote("a"));
        assert!(StoreKey::group("a") < StoreKey::group("b"));
        assert_ne!(StoreKey::hosted("a"), StoreKey::remote("a"));
    }

    #[test]
    fn test_materialized_prefix() {
        assert_eq!(StoreKey::group("test").materialized_prefix(), "group-test");
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_string(&StoreKey::hosted("source")).unwrap();
        assert_eq!(json, r#"{"type":"hosted","name":"source"}"#);
    }
}
