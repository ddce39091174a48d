mod keys;
mod shard_map;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use cinder_store::Store;

use crate::config::CollectionOptions;
use crate::error::DbError;

pub use keys::{KeyGenerator, validate_key};
pub use shard_map::{ShardId, ShardMap};

const MAX_NAME_LEN: usize = 256;
const MAX_SHARD_KEYS: usize = 8;
const FIRST_SHARD_NUMBER: u64 = 100_001;

/// A collection and the stores backing its shards.
///
/// Cheap to clone; all clones share the same shards.
pub struct CollectionHandle<S> {
    inner: Arc<CollectionInner<S>>,
}

struct CollectionInner<S> {
    name: String,
    replication_factor: u32,
    shard_map: ShardMap,
    stores: Vec<S>,
}

impl<S> Clone for CollectionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::fmt::Debug for CollectionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("name", &self.inner.name)
            .field("shards", &self.inner.shard_map.shards())
            .field("shard_keys", &self.inner.shard_map.shard_keys())
            .finish()
    }
}

impl<S: Store> CollectionHandle<S> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.inner.shard_map
    }

    pub fn shard_keys(&self) -> &[String] {
        self.inner.shard_map.shard_keys()
    }

    pub fn shards(&self) -> &[ShardId] {
        self.inner.shard_map.shards()
    }

    pub fn number_of_shards(&self) -> usize {
        self.inner.stores.len()
    }

    pub fn replication_factor(&self) -> u32 {
        self.inner.replication_factor
    }

    pub(crate) fn store(&self, shard: usize) -> &S {
        &self.inner.stores[shard]
    }

    /// Documents across all shards.
    pub fn count(&self) -> u64 {
        self.inner.stores.iter().map(|s| s.len() as u64).sum()
    }

    pub(crate) fn truncate(&self) -> Result<(), DbError> {
        for store in &self.inner.stores {
            store.clear()?;
        }
        Ok(())
    }
}

pub(crate) type Snapshot<S> = Arc<HashMap<String, CollectionHandle<S>>>;

/// The set of collections of one database.
///
/// Readers take a [`Snapshot`] and never block; create and drop swap in a
/// new map under a mutex.
pub(crate) struct Catalog<S> {
    collections: ArcSwap<HashMap<String, CollectionHandle<S>>>,
    ddl_lock: Mutex<()>,
    next_shard: AtomicU64,
}

impl<S: Store> Catalog<S> {
    pub fn new() -> Self {
        Self {
            collections: ArcSwap::from_pointee(HashMap::new()),
            ddl_lock: Mutex::new(()),
            next_shard: AtomicU64::new(FIRST_SHARD_NUMBER),
        }
    }

    pub fn snapshot(&self) -> Snapshot<S> {
        self.collections.load_full()
    }

    pub fn get(&self, name: &str) -> Result<CollectionHandle<S>, DbError> {
        self.collections
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        name: &str,
        options: &CollectionOptions,
        default_shards: u32,
        new_store: impl Fn() -> S,
    ) -> Result<CollectionHandle<S>, DbError> {
        validate_name(name)?;
        validate_shard_keys(&options.shard_keys)?;
        let number_of_shards = options.number_of_shards.unwrap_or(default_shards);
        if number_of_shards == 0 {
            return Err(DbError::BadParameter(
                "numberOfShards must be at least 1".into(),
            ));
        }
        if options.replication_factor == 0 {
            return Err(DbError::BadParameter(
                "replicationFactor must be at least 1".into(),
            ));
        }

        let _guard = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.collections.load_full();
        if current.contains_key(name) {
            return Err(DbError::DuplicateName(name.to_string()));
        }

        let first = self
            .next_shard
            .fetch_add(u64::from(number_of_shards), Ordering::Relaxed);
        let shards = (0..u64::from(number_of_shards))
            .map(|i| ShardId::new(first + i))
            .collect();
        let handle = CollectionHandle {
            inner: Arc::new(CollectionInner {
                name: name.to_string(),
                replication_factor: options.replication_factor,
                shard_map: ShardMap::new(shards, options.shard_keys.clone()),
                stores: (0..number_of_shards).map(|_| new_store()).collect(),
            }),
        };

        let mut next = HashMap::clone(&current);
        next.insert(name.to_string(), handle.clone());
        self.collections.store(Arc::new(next));
        Ok(handle)
    }

    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        let _guard = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.collections.load_full();
        if !current.contains_key(name) {
            return Err(DbError::CollectionNotFound(name.to_string()));
        }
        let mut next = HashMap::clone(&current);
        next.remove(name);
        self.collections.store(Arc::new(next));
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), DbError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if first_ok && rest_ok && name.len() <= MAX_NAME_LEN {
        Ok(())
    } else {
        Err(DbError::IllegalName(name.to_string()))
    }
}

fn validate_shard_keys(keys: &[String]) -> Result<(), DbError> {
    if keys.is_empty() || keys.len() > MAX_SHARD_KEYS {
        return Err(DbError::BadParameter(format!(
            "shardKeys must have between 1 and {MAX_SHARD_KEYS} attributes"
        )));
    }
    for key in keys {
        if key.is_empty() || key == "_id" || key == "_rev" {
            return Err(DbError::BadParameter(format!("invalid shard key '{key}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cinder_store::MemoryStore;

    use super::*;

    fn catalog() -> Catalog<MemoryStore> {
        Catalog::new()
    }

    #[test]
    fn create_and_lookup() {
        let cat = catalog();
        let opts = CollectionOptions::with_shards(5).shard_keys(["id"]);
        let c = cat.create("UnitTestsFoo", &opts, 1, MemoryStore::new).unwrap();
        assert_eq!(c.number_of_shards(), 5);
        assert_eq!(c.shard_keys(), ["id"]);
        assert_eq!(cat.get("UnitTestsFoo").unwrap().shards(), c.shards());
    }

    #[test]
    fn default_shard_count() {
        let cat = catalog();
        let c = cat
            .create("c", &CollectionOptions::default(), 3, MemoryStore::new)
            .unwrap();
        assert_eq!(c.number_of_shards(), 3);
        assert!(c.shard_map().uses_default_sharding());
    }

    #[test]
    fn shard_ids_are_unique_across_collections() {
        let cat = catalog();
        let a = cat
            .create("a", &CollectionOptions::with_shards(2), 1, MemoryStore::new)
            .unwrap();
        let b = cat
            .create("b", &CollectionOptions::with_shards(2), 1, MemoryStore::new)
            .unwrap();
        for s in a.shards() {
            assert!(!b.shards().contains(s));
        }
    }

    #[test]
    fn duplicate_name() {
        let cat = catalog();
        cat.create("c", &CollectionOptions::default(), 1, MemoryStore::new)
            .unwrap();
        let err = cat
            .create("c", &CollectionOptions::default(), 1, MemoryStore::new)
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateName(_)));
    }

    #[test]
    fn illegal_names() {
        let cat = catalog();
        for name in ["", "1abc", "a b", "a/b"] {
            let err = cat
                .create(name, &CollectionOptions::default(), 1, MemoryStore::new)
                .unwrap_err();
            assert!(matches!(err, DbError::IllegalName(_)), "{name:?}");
        }
    }

    #[test]
    fn rejects_bad_shard_keys() {
        let cat = catalog();
        for keys in [vec![], vec!["_id"], vec!["_rev"]] {
            let opts = CollectionOptions::default().shard_keys(keys);
            assert!(matches!(
                cat.create("c", &opts, 1, MemoryStore::new),
                Err(DbError::BadParameter(_))
            ));
        }
    }

    #[test]
    fn drop_keeps_snapshots_alive() {
        let cat = catalog();
        cat.create("c", &CollectionOptions::default(), 1, MemoryStore::new)
            .unwrap();
        let snap = cat.snapshot();
        cat.drop_collection("c").unwrap();
        assert!(snap.contains_key("c"));
        assert!(matches!(cat.get("c"), Err(DbError::CollectionNotFound(_))));
        assert!(matches!(
            cat.drop_collection("c"),
            Err(DbError::CollectionNotFound(_))
        ));
    }
}
