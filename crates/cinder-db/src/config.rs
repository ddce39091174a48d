use std::str::FromStr;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Database-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Shard count for collections created without `numberOfShards`.
    pub default_number_of_shards: u32,
    /// Capacity of each shard worker's input channel.
    pub channel_capacity: usize,
    /// Runtime limit in seconds applied when a query sets none.
    pub max_runtime: Option<f64>,
    /// Commit a shard's transaction every N writes when a query sets none.
    pub intermediate_commit_count: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_number_of_shards: 1,
            channel_capacity: 1024,
            max_runtime: None,
            intermediate_commit_count: None,
        }
    }
}

impl DatabaseConfig {
    /// Defaults overridden by `CINDER_SHARDS`, `CINDER_CHANNEL_CAPACITY`,
    /// `CINDER_MAX_RUNTIME` and `CINDER_INTERMEDIATE_COMMIT_COUNT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_number_of_shards: env_or("CINDER_SHARDS", defaults.default_number_of_shards),
            channel_capacity: env_or("CINDER_CHANNEL_CAPACITY", defaults.channel_capacity),
            max_runtime: env_opt("CINDER_MAX_RUNTIME"),
            intermediate_commit_count: env_opt("CINDER_INTERMEDIATE_COMMIT_COUNT"),
        }
    }
}

fn env_opt<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env_opt(name).unwrap_or(default)
}

// ── Collections ─────────────────────────────────────────────

/// Options accepted when creating a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollectionOptions {
    /// `None` uses [`DatabaseConfig::default_number_of_shards`].
    pub number_of_shards: Option<u32>,
    pub shard_keys: Vec<String>,
    pub replication_factor: u32,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            number_of_shards: None,
            shard_keys: vec!["_key".to_string()],
            replication_factor: 1,
        }
    }
}

impl CollectionOptions {
    pub fn with_shards(number_of_shards: u32) -> Self {
        Self {
            number_of_shards: Some(number_of_shards),
            ..Self::default()
        }
    }

    pub fn shard_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.shard_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_document(doc: Document) -> Result<Self, DbError> {
        bson::deserialize_from_document(doc)
            .map_err(|e| DbError::BadParameter(format!("collection options: {e}")))
    }
}

// ── Queries ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerOptions {
    /// Rule toggles: `-name` disables, `+name` enables, `-all`/`+all` apply
    /// to every rule that can be switched off.
    pub rules: Vec<String>,
}

/// Per-query options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub optimizer: OptimizerOptions,
    /// Seconds after which the query is killed.
    pub max_runtime: Option<f64>,
    /// Commit each shard's transaction every N writes.
    pub intermediate_commit_count: Option<u64>,
}

impl QueryOptions {
    pub fn from_document(doc: Document) -> Result<Self, DbError> {
        bson::deserialize_from_document(doc)
            .map_err(|e| DbError::BadParameter(format!("query options: {e}")))
    }

    pub fn with_rules<I, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            optimizer: OptimizerOptions {
                rules: rules.into_iter().map(Into::into).collect(),
            },
            ..Self::default()
        }
    }
}

/// `OPTIONS { ... }` of a data-modification clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModificationOptions {
    pub ignore_errors: bool,
    pub wait_for_sync: bool,
    pub keep_null: bool,
    pub merge_objects: bool,
    pub overwrite: bool,
    pub ignore_revs: bool,
}

impl Default for ModificationOptions {
    fn default() -> Self {
        Self {
            ignore_errors: false,
            wait_for_sync: false,
            keep_null: true,
            merge_objects: true,
            overwrite: false,
            ignore_revs: true,
        }
    }
}

impl ModificationOptions {
    pub(crate) fn from_bson(value: Bson) -> Result<Self, DbError> {
        match value {
            Bson::Document(doc) => bson::deserialize_from_document(doc)
                .map_err(|e| DbError::BadParameter(format!("modification options: {e}"))),
            Bson::Null => Ok(Self::default()),
            other => Err(DbError::BadParameter(format!(
                "OPTIONS must be an object, got {other}"
            ))),
        }
    }
}
