use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bson::{Bson, Document, doc};
use cinder_query::Query;
use cinder_store::{MemoryStore, Store, Transaction};

use crate::catalog::{Catalog, CollectionHandle, KeyGenerator, ShardId};
use crate::config::{CollectionOptions, DatabaseConfig, QueryOptions};
use crate::cursor::Cursor;
use crate::document::decode;
use crate::error::{DbError, QueryFailure};
use crate::executor::{self, QueryOutput};
use crate::explain::Explain;
use crate::planner::{self, RuleSet};
use crate::registry::{QueryRegistry, RunningQuery};
use crate::session::{CancellationToken, Session};

struct Inner<S> {
    catalog: Catalog<S>,
    keys: KeyGenerator,
    registry: QueryRegistry,
    config: DatabaseConfig,
    /// Held by modification statements for their whole execution.
    write_lock: Mutex<()>,
    new_store: Box<dyn Fn() -> S + Send + Sync>,
}

/// A set of sharded collections and the entry point for queries.
///
/// Cloning is cheap; clones share collections and running queries.
pub struct Database<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Database<MemoryStore> {
    /// A database whose shards live in [`MemoryStore`]s.
    pub fn in_memory(config: DatabaseConfig) -> Self {
        Self::with_store(config, MemoryStore::new)
    }
}

impl<S: Store + Send + Sync + 'static> Database<S> {
    /// A database that calls `new_store` once for every shard it creates.
    pub fn with_store(config: DatabaseConfig, new_store: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog: Catalog::new(),
                keys: KeyGenerator::new(),
                registry: QueryRegistry::new(),
                config,
                write_lock: Mutex::new(()),
                new_store: Box::new(new_store),
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    // ── Collections ─────────────────────────────────────────

    pub fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<CollectionHandle<S>, DbError> {
        let handle = self.inner.catalog.create(
            name,
            &options,
            self.inner.config.default_number_of_shards,
            &self.inner.new_store,
        )?;
        tracing::info!(
            collection = name,
            shards = handle.number_of_shards(),
            shard_keys = ?handle.shard_keys(),
            "created collection"
        );
        Ok(handle)
    }

    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        self.inner.catalog.drop_collection(name)?;
        tracing::info!(collection = name, "dropped collection");
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<CollectionHandle<S>, DbError> {
        self.inner.catalog.get(name)
    }

    /// Collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        self.inner.catalog.names()
    }

    /// The shard responsible for `document`. Missing shard-key attributes
    /// hash as `null`.
    pub fn shard_for(&self, collection: &str, document: &Document) -> Result<ShardId, DbError> {
        let handle = self.collection(collection)?;
        let map = handle.shard_map();
        Ok(map.shard_for(&map.key_tuple(document)).clone())
    }

    // ── Documents ───────────────────────────────────────────

    /// Inserts one document and returns it with its system attributes.
    pub fn insert(&self, collection: &str, document: Document) -> Result<Document, QueryFailure> {
        let cursor = self.query(
            "INSERT @doc INTO @@collection RETURN NEW",
            doc! { "doc": document, "@collection": collection },
            QueryOptions::default(),
        )?;
        match cursor.into_rows().pop() {
            Some(Bson::Document(stored)) => Ok(stored),
            _ => Err(DbError::Internal("insert returned no document".into()).into()),
        }
    }

    /// Reads a document by `_key`.
    pub fn document(&self, collection: &str, key: &str) -> Result<Option<Document>, DbError> {
        let handle = self.collection(collection)?;
        let map = handle.shard_map();
        let shards: Vec<usize> = if map.uses_default_sharding() {
            vec![map.shard_index(&[Bson::String(key.to_string())])]
        } else {
            (0..handle.number_of_shards()).collect()
        };
        for shard in shards {
            let txn = handle.store(shard).begin(true)?;
            let found = txn.get(key.as_bytes())?;
            txn.rollback()?;
            if let Some(bytes) = found {
                return Ok(Some(decode(&bytes)?));
            }
        }
        Ok(None)
    }

    pub fn count(&self, collection: &str) -> Result<u64, DbError> {
        Ok(self.collection(collection)?.count())
    }

    /// Removes every document of a collection.
    pub fn truncate(&self, collection: &str) -> Result<(), DbError> {
        let handle = self.collection(collection)?;
        let _write = self.write_lock();
        handle.truncate()?;
        tracing::info!(collection, "truncated collection");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────

    fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session<'a>(
        &'a self,
        bind_vars: &'a Document,
        options: &'a QueryOptions,
        token: CancellationToken,
    ) -> Session<'a, S> {
        Session {
            catalog: self.inner.catalog.snapshot(),
            bind_vars,
            options,
            config: &self.inner.config,
            rules: RuleSet::from_options(&options.optimizer.rules),
            token,
            keys: &self.inner.keys,
        }
    }

    fn token(&self, options: &QueryOptions) -> Result<CancellationToken, DbError> {
        CancellationToken::new(options.max_runtime.or(self.inner.config.max_runtime))
    }

    /// Parses, plans and executes a query.
    ///
    /// On failure, writes already committed by some shards stay in place and
    /// are reported in [`QueryFailure::stats`].
    pub fn query(
        &self,
        text: &str,
        bind_vars: Document,
        options: QueryOptions,
    ) -> Result<Cursor, QueryFailure> {
        let started = Instant::now();
        let parsed = cinder_query::parse(text).map_err(DbError::from)?;
        let token = self.token(&options)?;
        let registration = self.inner.registry.register(text, token.clone());
        let query_id = registration.id();
        let session = self.session(&bind_vars, &options, token);

        let result = self.run(&parsed, &session);
        drop(registration);
        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(QueryOutput { rows, mut stats }) => {
                stats.execution_time = elapsed;
                tracing::debug!(
                    query_id,
                    rows = rows.len(),
                    writes_executed = stats.writes_executed,
                    writes_ignored = stats.writes_ignored,
                    "query finished"
                );
                Ok(Cursor::new(rows, stats))
            }
            Err(mut failure) => {
                failure.stats.execution_time = elapsed;
                tracing::warn!(
                    query_id,
                    code = failure.error.error_num(),
                    error = %failure.error,
                    "query failed"
                );
                Err(failure)
            }
        }
    }

    fn run(&self, query: &Query, session: &Session<'_, S>) -> Result<QueryOutput, QueryFailure> {
        let plan = planner::plan(query, session)?;
        let _write = plan.is_modification().then(|| self.write_lock());
        executor::execute(&plan, session)
    }

    /// Plans a query without executing it.
    pub fn explain(
        &self,
        text: &str,
        bind_vars: Document,
        options: QueryOptions,
    ) -> Result<Explain, DbError> {
        let parsed = cinder_query::parse(text)?;
        let session = self.session(&bind_vars, &options, self.token(&options)?);
        let plan = planner::plan(&parsed, &session)?;
        Ok(Explain::of(&plan))
    }

    /// Queries currently executing, oldest first.
    pub fn running_queries(&self) -> Vec<RunningQuery> {
        self.inner.registry.list()
    }

    /// Cancels a running query. It fails with `ERROR_QUERY_KILLED` at its
    /// next cancellation check.
    pub fn kill(&self, id: u64) -> Result<(), DbError> {
        self.inner.registry.kill(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database<MemoryStore> {
        Database::in_memory(DatabaseConfig::default())
    }

    #[test]
    fn default_shard_count_comes_from_config() {
        let db = Database::in_memory(DatabaseConfig {
            default_number_of_shards: 3,
            ..DatabaseConfig::default()
        });
        let c = db.create_collection("c", CollectionOptions::default()).unwrap();
        assert_eq!(c.number_of_shards(), 3);
        assert_eq!(db.collections(), vec!["c".to_string()]);
    }

    #[test]
    fn insert_and_read_back() {
        let db = db();
        db.create_collection("c", CollectionOptions::with_shards(4)).unwrap();
        let stored = db.insert("c", doc! { "_key": "a", "v": 1 }).unwrap();
        assert_eq!(stored.get_str("_id").unwrap(), "c/a");
        let read = db.document("c", "a").unwrap().unwrap();
        assert_eq!(read.get_i32("v").unwrap(), 1);
        assert_eq!(db.count("c").unwrap(), 1);
        assert!(db.document("c", "b").unwrap().is_none());
    }

    #[test]
    fn document_on_custom_sharding_searches_every_shard() {
        let db = db();
        db.create_collection("c", CollectionOptions::with_shards(3).shard_keys(["id"]))
            .unwrap();
        db.insert("c", doc! { "_key": "x", "id": 7 }).unwrap();
        assert!(db.document("c", "x").unwrap().is_some());
    }

    #[test]
    fn truncate_empties_every_shard() {
        let db = db();
        db.create_collection("c", CollectionOptions::with_shards(2)).unwrap();
        for i in 0..10 {
            db.insert("c", doc! { "n": i }).unwrap();
        }
        db.truncate("c").unwrap();
        assert_eq!(db.count("c").unwrap(), 0);
    }

    #[test]
    fn wait_for_sync_selects_synced_commits() {
        let db = db();
        let c = db.create_collection("c", CollectionOptions::with_shards(1)).unwrap();
        db.query(
            "INSERT { _key: 'a' } INTO c OPTIONS { waitForSync: true }",
            doc! {},
            QueryOptions::default(),
        )
        .unwrap();
        db.query("INSERT { _key: 'b' } INTO c", doc! {}, QueryOptions::default())
            .unwrap();
        db.query(
            "FOR k IN ['x', 'y'] INSERT { _key: k } INTO c OPTIONS { waitForSync: true }",
            doc! {},
            QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(c.store(0).synced_commits(), 2);
        assert_eq!(c.count(), 4);
    }

    #[test]
    fn missing_collection() {
        let db = db();
        let err = db.query("FOR d IN nope RETURN d", doc! {}, QueryOptions::default());
        assert_eq!(err.unwrap_err().error.error_num(), 1203);
        assert!(matches!(db.truncate("nope"), Err(DbError::CollectionNotFound(_))));
    }

    #[test]
    fn kill_unknown_query() {
        assert!(matches!(db().kill(42), Err(DbError::QueryNotFound(42))));
    }

    #[test]
    fn huge_max_runtime_is_rejected() {
        let options = QueryOptions {
            max_runtime: Some(1e300),
            ..QueryOptions::default()
        };
        let err = db().query("RETURN 1", doc! {}, options).unwrap_err();
        assert_eq!(err.error.error_num(), 10);
    }

    #[test]
    fn finished_queries_leave_the_registry() {
        let db = db();
        db.query("RETURN 1", doc! {}, QueryOptions::default()).unwrap();
        assert!(db.running_queries().is_empty());
    }
}
