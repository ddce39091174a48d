use std::sync::atomic::{AtomicBool, Ordering};

use bson::{Bson, Document};
use cinder_query::{Row, Scope, Subqueries};
use cinder_store::{Durability, Store, Transaction};
use crossbeam::channel::{Receiver, Sender};

use super::modify::{WorkItem, WriteContext, WriteOutcome};
use super::source::{Flow, scan_shard};
use crate::catalog::CollectionHandle;
use crate::document::decode;
use crate::error::DbError;
use crate::planner::plan::{Output, Pipeline, Source};
use crate::session::CancellationToken;
use crate::stats::ExecutionStats;

/// Messages from shard workers to the coordinator.
#[derive(Debug)]
pub(crate) enum Event {
    Output {
        seq: u64,
        shard: usize,
        /// What `RETURN` needs; `None` when rows are only counted.
        written: Option<Written>,
    },
    Finished {
        shard: usize,
        stats: ExecutionStats,
        error: Option<DbError>,
    },
}

/// A written row, projected by the coordinator once the workers are done.
#[derive(Debug)]
pub(crate) struct Written {
    pub row: Row,
    pub old: Option<Document>,
    pub new: Option<Document>,
}

/// The write transaction of one shard for the duration of a statement.
pub(crate) struct ShardWriter<'s, S: Store + 's> {
    store: &'s S,
    txn: Option<S::Txn<'s>>,
    durability: Durability,
    commit_every: Option<u64>,
    uncommitted: u64,
    pending: ExecutionStats,
    committed: ExecutionStats,
}

impl<'s, S: Store> ShardWriter<'s, S> {
    pub fn new(store: &'s S, wait_for_sync: bool, commit_every: Option<u64>) -> Self {
        Self {
            store,
            txn: None,
            durability: if wait_for_sync {
                Durability::Sync
            } else {
                Durability::Buffered
            },
            commit_every,
            uncommitted: 0,
            pending: ExecutionStats::default(),
            committed: ExecutionStats::default(),
        }
    }

    fn txn(&mut self) -> Result<&S::Txn<'s>, DbError> {
        if self.txn.is_none() {
            self.txn = Some(self.store.begin(false)?);
        }
        self.txn
            .as_ref()
            .ok_or_else(|| DbError::Internal("shard transaction missing".into()))
    }

    /// The first document of this shard, uncommitted writes included, that
    /// satisfies `matches`.
    pub fn find(&mut self, matches: impl Fn(&Document) -> bool) -> Result<Option<Document>, DbError> {
        let txn = self.txn()?;
        for entry in txn.scan()? {
            let (_, bytes) = entry?;
            let doc = decode(&bytes)?;
            if matches(&doc) {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    pub fn write(&mut self, ctx: &WriteContext<'_>, item: &WorkItem) -> Result<WriteOutcome, DbError> {
        let outcome = ctx.apply(self.txn()?, item)?;
        match outcome {
            WriteOutcome::Executed { .. } => {
                self.pending.writes_executed += 1;
                self.uncommitted += 1;
            }
            WriteOutcome::Ignored => self.pending.writes_ignored += 1,
        }
        if let Some(every) = self.commit_every
            && self.uncommitted >= every
        {
            tracing::trace!(writes = self.uncommitted, "intermediate commit");
            self.commit()?;
        }
        Ok(outcome)
    }

    pub fn commit(&mut self) -> Result<(), DbError> {
        if let Some(txn) = self.txn.take() {
            txn.commit(self.durability)?;
        }
        self.committed += std::mem::take(&mut self.pending);
        self.uncommitted = 0;
        Ok(())
    }

    /// Discards everything since the last commit.
    pub fn rollback(&mut self) {
        if let Some(txn) = self.txn.take()
            && let Err(e) = txn.rollback()
        {
            tracing::warn!(error = %e, "shard rollback failed");
        }
        self.pending = ExecutionStats::default();
        self.uncommitted = 0;
    }

    pub fn committed(&self) -> ExecutionStats {
        self.committed
    }
}

/// Evaluates the `RETURN` expression for a written document.
pub(crate) fn project(
    output: &Output,
    bind_vars: &Document,
    subqueries: Option<&dyn Subqueries>,
    written: Written,
) -> Result<Option<Bson>, DbError> {
    match output {
        Output::Return(expr) => {
            let row = written
                .row
                .with("OLD", written.old.map_or(Bson::Null, Bson::Document))
                .with("NEW", written.new.map_or(Bson::Null, Bson::Document));
            let mut scope = Scope::new(bind_vars, &row);
            scope.subqueries = subqueries;
            Ok(Some(expr.evaluate(&scope)?))
        }
        Output::Count { .. } | Output::Discard => Ok(None),
    }
}

/// Shared state of the workers of one modification.
pub(crate) struct Worker<'a, S> {
    pub collection: &'a CollectionHandle<S>,
    pub write: WriteContext<'a>,
    pub output: &'a Output,
    pub bind_vars: &'a Document,
    pub token: &'a CancellationToken,
    /// Set by whoever fails first; everyone else stops and rolls back.
    pub abort: &'a AtomicBool,
    pub wait_for_sync: bool,
    pub commit_every: Option<u64>,
}

impl<S: Store> Worker<'_, S> {
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn writer(&self, shard: usize) -> ShardWriter<'_, S> {
        ShardWriter::new(
            self.collection.store(shard),
            self.wait_for_sync,
            self.commit_every,
        )
    }

    fn apply(
        &self,
        writer: &mut ShardWriter<'_, S>,
        shard: usize,
        item: WorkItem,
        events: &Sender<Event>,
    ) -> Result<(), DbError> {
        self.token.check()?;
        if let WriteOutcome::Executed { old, new } = writer.write(&self.write, &item)? {
            let written = match self.output {
                Output::Discard => return Ok(()),
                Output::Count { .. } => None,
                Output::Return(_) => Some(Written {
                    row: item.row,
                    old,
                    new,
                }),
            };
            // The coordinator outlives every worker.
            let _ = events.send(Event::Output {
                seq: item.seq,
                shard,
                written,
            });
        }
        Ok(())
    }

    /// Commits unless the statement failed, then reports to the coordinator.
    fn finish(
        &self,
        mut writer: ShardWriter<'_, S>,
        shard: usize,
        result: Result<(), DbError>,
        scanned: ExecutionStats,
        events: &Sender<Event>,
    ) {
        let result = result.and_then(|()| self.token.check());
        let error = match result {
            Ok(()) if !self.aborted() => writer.commit().err(),
            Ok(()) => {
                writer.rollback();
                None
            }
            Err(e) => {
                writer.rollback();
                Some(e)
            }
        };
        if let Some(e) = &error {
            tracing::debug!(shard, error = %e, "shard worker failed");
            self.abort.store(true, Ordering::Release);
        }
        let mut stats = writer.committed();
        stats += scanned;
        tracing::debug!(
            shard,
            writes_executed = stats.writes_executed,
            writes_ignored = stats.writes_ignored,
            "shard worker finished"
        );
        let _ = events.send(Event::Finished {
            shard,
            stats,
            error,
        });
    }

    /// Applies rows the coordinator routes to `shard` until the input closes.
    pub fn run(&self, shard: usize, input: Receiver<WorkItem>, events: Sender<Event>) {
        let mut writer = self.writer(shard);
        let mut result = Ok(());
        for item in input.iter() {
            if self.aborted() {
                break;
            }
            if let Err(e) = self.apply(&mut writer, shard, item, &events) {
                result = Err(e);
                break;
            }
        }
        drop(input);
        self.finish(writer, shard, result, ExecutionStats::default(), &events);
    }

    /// Enumerates `shard` and modifies the matching documents in place.
    pub fn run_local(&self, shard: usize, p: &Pipeline<S>, outer: &Row, events: Sender<Event>) {
        let mut writer = self.writer(shard);
        let mut scanned = ExecutionStats::default();
        let result = match (&p.source, &p.modification) {
            (Source::Collection(scan), Some(m)) => {
                let mut seq = 0u64;
                scan_shard(
                    self.collection.store(shard),
                    scan,
                    &p.filters,
                    self.bind_vars,
                    self.token,
                    outer,
                    &mut scanned,
                    |row| {
                        if self.aborted() {
                            return Ok(Flow::Stop);
                        }
                        let scope = Scope::new(self.bind_vars, &row);
                        let selector = m.op.selector().evaluate(&scope)?;
                        let document = m.op.document().map(|d| d.evaluate(&scope)).transpose()?;
                        let item = WorkItem {
                            seq,
                            row,
                            selector,
                            document,
                            speculative: false,
                        };
                        seq += 1;
                        self.apply(&mut writer, shard, item, &events)?;
                        Ok(Flow::Continue)
                    },
                )
            }
            _ => Err(DbError::Internal(
                "local modification without collection source".into(),
            )),
        };
        self.finish(writer, shard, result, scanned, &events);
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use cinder_store::MemoryStore;

    use super::*;
    use crate::catalog::{Catalog, KeyGenerator};
    use crate::config::{CollectionOptions, ModificationOptions};
    use crate::planner::plan::ModifyKind;

    fn insert_item(seq: u64, key: &str) -> WorkItem {
        WorkItem {
            seq,
            row: Row::new(),
            selector: Bson::Document(doc! { "_key": key }),
            document: None,
            speculative: false,
        }
    }

    #[test]
    fn intermediate_commits_survive_rollback() {
        let catalog: Catalog<MemoryStore> = Catalog::new();
        let c = catalog
            .create("c", &CollectionOptions::with_shards(1), 1, MemoryStore::new)
            .unwrap();
        let keys = KeyGenerator::new();
        let options = ModificationOptions::default();
        let ctx = WriteContext {
            kind: ModifyKind::Insert,
            collection: "c",
            shard_map: c.shard_map(),
            options: &options,
            keys: &keys,
        };
        let mut writer = ShardWriter::new(c.store(0), false, Some(2));
        for i in 0..5 {
            writer.write(&ctx, &insert_item(i, &format!("k{i}"))).unwrap();
        }
        writer.rollback();
        assert_eq!(writer.committed().writes_executed, 4);
        assert_eq!(c.count(), 4);
    }

    #[test]
    fn sync_commits_reach_the_store() {
        let catalog: Catalog<MemoryStore> = Catalog::new();
        let c = catalog
            .create("c", &CollectionOptions::with_shards(1), 1, MemoryStore::new)
            .unwrap();
        let keys = KeyGenerator::new();
        let options = ModificationOptions::default();
        let ctx = WriteContext {
            kind: ModifyKind::Insert,
            collection: "c",
            shard_map: c.shard_map(),
            options: &options,
            keys: &keys,
        };
        let mut writer = ShardWriter::new(c.store(0), true, None);
        writer.write(&ctx, &insert_item(0, "a")).unwrap();
        writer.commit().unwrap();
        assert_eq!(c.store(0).synced_commits(), 1);
        assert_eq!(writer.committed().writes_executed, 1);
    }

    #[test]
    fn project_binds_old_and_new() {
        let query = cinder_query::parse("FOR d IN c UPDATE d WITH {} IN c RETURN [OLD, NEW]").unwrap();
        let output = Output::Return(query.ret.unwrap());
        let written = Written {
            row: Row::new(),
            old: None,
            new: Some(doc! { "a": 1 }),
        };
        let v = project(&output, &doc! {}, None, written).unwrap().unwrap();
        assert_eq!(v, bson::bson!([null, { "a": 1 }]));
    }

    #[test]
    fn find_sees_uncommitted_writes() {
        let catalog: Catalog<MemoryStore> = Catalog::new();
        let c = catalog
            .create("c", &CollectionOptions::with_shards(1), 1, MemoryStore::new)
            .unwrap();
        let keys = KeyGenerator::new();
        let options = ModificationOptions::default();
        let ctx = WriteContext {
            kind: ModifyKind::Insert,
            collection: "c",
            shard_map: c.shard_map(),
            options: &options,
            keys: &keys,
        };
        let mut writer = ShardWriter::new(c.store(0), false, None);
        assert!(writer.find(|_| true).unwrap().is_none());
        writer.write(&ctx, &insert_item(0, "a")).unwrap();
        let found = writer.find(|d| d.get_str("_key").ok() == Some("a")).unwrap().unwrap();
        assert_eq!(found.get_str("_id").unwrap(), "c/a");
        writer.rollback();
        assert_eq!(c.count(), 0);
    }
}
