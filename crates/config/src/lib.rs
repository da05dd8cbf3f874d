//! Configuration for depot.
//!
//! Settings are layered: built-in defaults, then a config file (TOML, YAML or
//! JSON, picked by extension), then `DEPOT_`-prefixed environment variables.
//! Nested keys use `__` in variable names, so `DEPOT_CACHE__LOCK_TIMEOUT=500`
//! sets `cache.lock_timeout`.

pub mod error;

use depot_cache::{DEFAULT_LOCK_TIMEOUT, DEFAULT_METRIC_PREFIX, MemoryCacheOptions};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::error::{Error, ErrorKind, Result};

pub const ENV_PREFIX: &str = "DEPOT_";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub name: String,
    pub metric_prefix: String,
    /// Evict the oldest entries beyond this many. Unbounded when unset.
    pub max_entries: Option<usize>,
    /// Seconds.
    pub ttl: Option<u64>,
    /// Milliseconds.
    pub lock_timeout: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: "merged-metadata".to_string(),
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            max_entries: None,
            ttl: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CacheSettings {
    pub fn options(&self) -> MemoryCacheOptions {
        MemoryCacheOptions {
            max_entries: self.max_entries,
            ttl: self.ttl.map(Duration::from_secs),
            lock_timeout: Duration::from_millis(self.lock_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeSettings {
    /// Milliseconds a merge recompute may take before readers give up.
    pub recompute_timeout: u64,
    /// Write merged documents to the materialization store.
    pub materialize: bool,
    /// Capacity of the invalidation channel.
    pub event_buffer: usize,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self { recompute_timeout: 30_000, materialize: true, event_buffer: 256 }
    }
}

impl MergeSettings {
    pub fn recompute_timeout(&self) -> Duration {
        Duration::from_millis(self.recompute_timeout)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheSettings,
    pub merge: MergeSettings,
}

impl Config {
    /// `$XDG_CONFIG_HOME/depot/config.toml`, or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "depot").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when it
    /// exists, then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.display().to_string())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.is_file()),
        };
        tracing::debug!(file = ?file, "Loading configuration");
        Self::from_figment(Self::figment(file.as_deref())?)
    }

    /// The layered sources, without extracting them.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.display().to_string())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| ErrorKind::Invalid { field, reason: reason.to_string() };
        if self.cache.name.trim().is_empty() {
            exn::bail!(invalid("cache.name", "must not be empty"));
        }
        if self.cache.lock_timeout == 0 {
            exn::bail!(invalid("cache.lock_timeout", "must be > 0"));
        }
        if self.cache.max_entries == Some(0) {
            exn::bail!(invalid("cache.max_entries", "must be > 0"));
        }
        if self.cache.ttl == Some(0) {
            exn::bail!(invalid("cache.ttl", "must be > 0"));
        }
        if self.merge.recompute_timeout == 0 {
            exn::bail!(invalid("merge.recompute_timeout", "must be > 0"));
        }
        if self.merge.event_buffer == 0 {
            exn::bail!(invalid("merge.event_buffer", "must be > 0"));
        }
        Ok(())
    }
}
