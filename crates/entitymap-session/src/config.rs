//! Unit-of-work configuration.

use crate::cache::EntityCache;
use entitymap_core::error::{CapacityError, ConfigError};
use entitymap_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What happens to the entity cache at a flush or commit boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Keep cached records (they are persisted and clean afterwards)
    Retain,
    /// Drop every cached record and relationship result set
    Clear,
}

const fn default_auto_begin() -> bool {
    true
}

const fn default_on_flush() -> CachePolicy {
    CachePolicy::Retain
}

const fn default_on_commit() -> CachePolicy {
    CachePolicy::Clear
}

/// Configuration of a [`UnitOfWork`](crate::UnitOfWork).
///
/// ```
/// use entitymap_session::{CachePolicy, UnitOfWorkConfig};
///
/// let config = UnitOfWorkConfig::from_json(
///     r#"{ "max_entries": { "author": 10 }, "on_commit": "retain" }"#,
/// )
/// .unwrap();
/// assert!(config.auto_begin);
/// assert_eq!(config.max_entries["author"], 10);
/// assert_eq!(config.on_commit, CachePolicy::Retain);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWorkConfig {
    /// Begin a store transaction on the first operation that needs one.
    #[serde(default = "default_auto_begin")]
    pub auto_begin: bool,

    /// Capacity for entity types without an explicit entry (`None` = unbounded).
    #[serde(default)]
    pub default_max_entries: Option<i64>,

    /// Per-entity-type capacities. 0 disables caching for that type.
    #[serde(default)]
    pub max_entries: HashMap<String, i64>,

    /// Cache policy after a successful flush.
    #[serde(default = "default_on_flush")]
    pub on_flush: CachePolicy,

    /// Cache policy after a successful commit.
    #[serde(default = "default_on_commit")]
    pub on_commit: CachePolicy,

    /// Warn after this many lazy loads of one relation (`None` disables tracking).
    #[serde(default)]
    pub lazy_load_threshold: Option<usize>,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            auto_begin: default_auto_begin(),
            default_max_entries: None,
            max_entries: HashMap::new(),
            on_flush: default_on_flush(),
            on_commit: default_on_commit(),
            lazy_load_threshold: None,
        }
    }
}

impl UnitOfWorkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields take their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid unit-of-work configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn default_max_entries(mut self, max: i64) -> Self {
        self.default_max_entries = Some(max);
        self
    }

    #[must_use]
    pub fn max_entries(mut self, entity: impl Into<String>, max: i64) -> Self {
        self.max_entries.insert(entity.into(), max);
        self
    }

    #[must_use]
    pub fn on_flush(mut self, policy: CachePolicy) -> Self {
        self.on_flush = policy;
        self
    }

    #[must_use]
    pub fn on_commit(mut self, policy: CachePolicy) -> Self {
        self.on_commit = policy;
        self
    }

    #[must_use]
    pub fn lazy_load_threshold(mut self, threshold: usize) -> Self {
        self.lazy_load_threshold = Some(threshold);
        self
    }

    /// Reject negative capacities.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.default_max_entries.filter(|m| *m < 0) {
            return Err(Error::CacheCapacity(CapacityError {
                entity: "*".to_string(),
                requested: max,
            }));
        }
        let mut entries: Vec<_> = self.max_entries.iter().collect();
        entries.sort();
        if let Some((entity, max)) = entries.into_iter().find(|(_, m)| **m < 0) {
            return Err(Error::CacheCapacity(CapacityError {
                entity: entity.clone(),
                requested: *max,
            }));
        }
        Ok(())
    }

    /// Build an empty cache with these capacities.
    #[allow(clippy::result_large_err)]
    pub fn build_cache(&self) -> Result<EntityCache> {
        self.validate()?;
        let default = self
            .default_max_entries
            .map(|m| usize::try_from(m).unwrap_or(usize::MAX));
        let mut cache = EntityCache::with_default_capacity(default);
        for (entity, max) in &self.max_entries {
            cache.resize(entity, *max)?;
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = UnitOfWorkConfig::default();
        assert!(config.auto_begin);
        assert_eq!(config.on_flush, CachePolicy::Retain);
        assert_eq!(config.on_commit, CachePolicy::Clear);
        assert!(config.lazy_load_threshold.is_none());
        assert_eq!(UnitOfWorkConfig::from_json("{}").unwrap(), config);
    }

    #[test]
    fn builder_and_cache() {
        let cache = UnitOfWorkConfig::new()
            .default_max_entries(50)
            .max_entries("author", 0)
            .build_cache()
            .unwrap();
        assert_eq!(cache.capacity("author"), Some(0));
        assert_eq!(cache.capacity("book"), Some(50));
    }

    #[test]
    fn negative_capacity_is_a_capacity_error() {
        let err = UnitOfWorkConfig::new()
            .max_entries("author", -5)
            .validate()
            .unwrap_err();
        match err {
            Error::CacheCapacity(e) => {
                assert_eq!(e.entity, "author");
                assert_eq!(e.requested, -5);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }
        assert!(UnitOfWorkConfig::new().default_max_entries(-1).build_cache().is_err());
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = UnitOfWorkConfig::from_json(r#"{ "on_flush": "sometimes" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
