use bson::{Bson, Document};
use cinder_query::value::equals;
use cinder_query::{Expr, ModificationKind, Row};
use cinder_store::Store;

use super::modify::{WorkItem, WriteContext, WriteOutcome, assign_key};
use super::source::{self, Flow};
use super::statement::Statement;
use super::worker::{ShardWriter, Written};
use super::{QueryOutput, count_rows, project_all, write_context};
use crate::catalog::{KeyGenerator, ShardMap};
use crate::document::{KEY, as_object};
use crate::error::{DbError, QueryFailure};
use crate::planner::plan::{ModificationStage, ModifyKind, Output, Pipeline};
use crate::stats::ExecutionStats;

/// A document matches when every attribute of `pattern` equals the
/// document's; a missing attribute reads as `null`.
fn matches(doc: &Document, pattern: &Document) -> bool {
    pattern
        .iter()
        .all(|(name, value)| equals(doc.get(name).unwrap_or(&Bson::Null), value))
}

/// The first document matching `pattern`, searching only the owning shard
/// when the pattern names every shard key.
fn locate<S: Store>(
    writers: &mut [ShardWriter<'_, S>],
    map: &ShardMap,
    pattern: &Document,
) -> Result<Option<(usize, Document)>, DbError> {
    let shards: Vec<usize> = match map.complete_key_tuple(pattern) {
        Some(tuple) => vec![map.shard_index(&tuple)],
        None => (0..writers.len()).collect(),
    };
    for shard in shards {
        if let Some(doc) = writers[shard].find(|doc| matches(doc, pattern))? {
            return Ok(Some((shard, doc)));
        }
    }
    Ok(None)
}

struct Upsert<'a> {
    search: &'a Expr,
    insert: &'a Expr,
    update: &'a Expr,
    map: &'a ShardMap,
    keys: &'a KeyGenerator,
}

/// What one row turns into: a write on one shard.
struct Planned {
    shard: usize,
    item: WorkItem,
    found: bool,
}

impl Upsert<'_> {
    fn plan<S: Store + Send + Sync>(
        &self,
        st: &Statement<'_, '_, S>,
        writers: &mut [ShardWriter<'_, S>],
        seq: u64,
        row: Row,
    ) -> Result<Planned, DbError> {
        let pattern = as_object(self.search.evaluate(&st.scope(&row))?)?;
        match locate(writers, self.map, &pattern)? {
            Some((shard, old)) => {
                let key = old
                    .get_str(KEY)
                    .map_err(|_| DbError::Internal("stored document without _key".into()))?
                    .to_string();
                let row = row.with("OLD", Bson::Document(old));
                let document = self.update.evaluate(&st.scope(&row))?;
                Ok(Planned {
                    shard,
                    item: WorkItem {
                        seq,
                        row,
                        selector: Bson::String(key),
                        document: Some(document),
                        speculative: false,
                    },
                    found: true,
                })
            }
            None => {
                let mut body = as_object(self.insert.evaluate(&st.scope(&row))?)?;
                let shard = if self.map.uses_default_sharding() {
                    let key = assign_key(&mut body, self.keys)?;
                    self.map.shard_index(&[Bson::String(key)])
                } else {
                    self.map.shard_index_of(&body)
                };
                Ok(Planned {
                    shard,
                    item: WorkItem {
                        seq,
                        row,
                        selector: Bson::Document(body),
                        document: None,
                        speculative: false,
                    },
                    found: false,
                })
            }
        }
    }
}

/// Looks up, then updates or inserts, one row at a time on the calling
/// thread. Every shard of the collection keeps one writer for the whole
/// statement, so each row sees the writes of the rows before it.
pub(super) fn run<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    m: &ModificationStage<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let ModificationKind::Upsert {
        search,
        insert,
        update,
        replace,
    } = &m.op
    else {
        return Err(DbError::Internal("upsert stage without UPSERT".into()).into());
    };
    let session = st.session;
    let upsert = Upsert {
        search,
        insert,
        update,
        map: m.collection.shard_map(),
        keys: session.keys,
    };
    let inserting = WriteContext {
        kind: ModifyKind::Insert,
        ..write_context(m, session)
    };
    let modifying = WriteContext {
        kind: if *replace {
            ModifyKind::Replace
        } else {
            ModifyKind::Update
        },
        ..write_context(m, session)
    };
    let mut writers: Vec<ShardWriter<'_, S>> = (0..m.collection.number_of_shards())
        .map(|shard| {
            ShardWriter::new(
                m.collection.store(shard),
                m.options.wait_for_sync,
                session.intermediate_commit_count(),
            )
        })
        .collect();

    let mut written = Vec::new();
    let mut executed = 0u64;
    let mut ignored = 0u64;
    let mut seq = 0u64;
    let scanned = source::for_each_row(p, st, outer, |row| {
        session.token.check()?;
        seq += 1;
        let planned = match upsert.plan(st, &mut writers, seq, row) {
            Ok(planned) => planned,
            Err(e) if m.options.ignore_errors && e.is_document_error() => {
                ignored += 1;
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };
        let ctx = if planned.found { &modifying } else { &inserting };
        let Some(writer) = writers.get_mut(planned.shard) else {
            return Err(DbError::Internal(format!("no writer for shard {}", planned.shard)));
        };
        if let WriteOutcome::Executed { old, new } = writer.write(ctx, &planned.item)? {
            executed += 1;
            if matches!(p.output, Output::Return(_)) {
                written.push(Written {
                    row: planned.item.row,
                    old,
                    new,
                });
            }
        }
        Ok(Flow::Continue)
    });

    let result = scanned.and_then(|scanned| {
        session.token.check()?;
        for writer in &mut writers {
            writer.commit()?;
        }
        Ok(scanned)
    });
    if result.is_err() {
        for writer in &mut writers {
            writer.rollback();
        }
    }
    let mut stats = ExecutionStats {
        writes_ignored: ignored,
        ..ExecutionStats::default()
    };
    for writer in &writers {
        stats += writer.committed();
    }
    let scanned = result.map_err(|e| QueryFailure::new(e, stats))?;
    stats += scanned;
    tracing::debug!(
        collection = m.collection.name(),
        writes_executed = stats.writes_executed,
        writes_ignored = stats.writes_ignored,
        "upsert finished"
    );

    let rows = match &p.output {
        Output::Discard => Ok(Vec::new()),
        Output::Return(_) => project_all(&p.output, st, written),
        Output::Count { variable, ret } => count_rows(variable, ret.as_ref(), executed, st, outer),
    };
    match rows {
        Ok(rows) => Ok(QueryOutput { rows, stats }),
        Err(e) => Err(QueryFailure::new(e, stats)),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn pattern_matching() {
        let stored = doc! { "_key": "a", "v": 1, "nested": { "x": 2 } };
        assert!(matches(&stored, &doc! { "v": 1 }));
        assert!(matches(&stored, &doc! { "v": 1.0 }));
        assert!(matches(&stored, &doc! { "nested": { "x": 2 } }));
        assert!(matches(&stored, &doc! { "missing": null }));
        assert!(!matches(&stored, &doc! { "v": 2 }));
        assert!(!matches(&stored, &doc! { "missing": 1 }));
        assert!(matches(&stored, &doc! {}));
    }
}
