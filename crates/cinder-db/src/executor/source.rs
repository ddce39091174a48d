use bson::{Bson, Document};
use cinder_query::value::{as_f64, truthy};
use cinder_query::{Expr, Row, Scope};
use cinder_store::{Store, Transaction};
use crossbeam::channel::{self, Receiver, Select};

use crate::document::decode;
use crate::error::DbError;
use super::statement::Statement;
use crate::planner::plan::{Pipeline, Scan, Source, Step};
use crate::session::{CancellationToken, Session};
use crate::stats::ExecutionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) fn passes(filters: &[Expr], bind_vars: &Document, row: &Row) -> Result<bool, DbError> {
    let scope = Scope::new(bind_vars, row);
    for filter in filters {
        if !truthy(&filter.evaluate(&scope)?) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Binds `LET` variables and applies the filters that follow them. `None`
/// means a filter dropped the row.
fn run_steps<S: Store + Send + Sync>(
    steps: &[Step],
    st: &Statement<'_, '_, S>,
    mut row: Row,
) -> Result<Option<Row>, DbError> {
    for step in steps {
        match step {
            Step::Let { variable, value } => {
                let value = value.evaluate(&st.scope(&row))?;
                row.set(variable, value);
            }
            Step::Filter(filter) => {
                if !truthy(&filter.evaluate(&st.scope(&row))?) {
                    return Ok(None);
                }
            }
        }
    }
    Ok(Some(row))
}

/// Enumerates the documents of one shard that pass `filters`. Rows extend
/// `outer`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_shard<S: Store>(
    store: &S,
    scan: &Scan<S>,
    filters: &[Expr],
    bind_vars: &Document,
    token: &CancellationToken,
    outer: &Row,
    stats: &mut ExecutionStats,
    mut visit: impl FnMut(Row) -> Result<Flow, DbError>,
) -> Result<(), DbError> {
    let txn = store.begin(true)?;
    let mut offer = |doc: Document, stats: &mut ExecutionStats| -> Result<Flow, DbError> {
        let row = outer.clone().with(&scan.variable, Bson::Document(doc));
        if passes(filters, bind_vars, &row)? {
            visit(row)
        } else {
            stats.filtered += 1;
            Ok(Flow::Continue)
        }
    };
    match &scan.lookup {
        Some(key) => {
            token.check()?;
            if let Some(bytes) = txn.get(key.as_bytes())? {
                stats.scanned_index += 1;
                offer(decode(&bytes)?, stats)?;
            }
        }
        None => {
            for entry in txn.scan()? {
                token.check()?;
                let (_, bytes) = entry?;
                stats.scanned_full += 1;
                if offer(decode(&bytes)?, stats)? == Flow::Stop {
                    break;
                }
            }
        }
    }
    txn.rollback()?;
    Ok(())
}

/// Applies `LIMIT offset, count` in front of a row consumer.
struct Limiter {
    skip: u64,
    remaining: Option<u64>,
}

impl Limiter {
    fn new<S>(p: &Pipeline<S>) -> Self {
        match p.limit {
            Some(l) => Limiter {
                skip: l.offset,
                remaining: Some(l.count),
            },
            None => Limiter {
                skip: 0,
                remaining: None,
            },
        }
    }

    fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    fn offer(
        &mut self,
        row: Row,
        sink: &mut impl FnMut(Row) -> Result<Flow, DbError>,
    ) -> Result<Flow, DbError> {
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(Flow::Continue);
        }
        match &mut self.remaining {
            Some(0) => return Ok(Flow::Stop),
            Some(n) => *n -= 1,
            None => {}
        }
        let flow = sink(row)?;
        if self.exhausted() {
            return Ok(Flow::Stop);
        }
        Ok(flow)
    }
}

/// Feeds every row the source of `p` produces, after FILTER, LET and
/// LIMIT, to `sink` on the calling thread. Rows extend `outer`.
///
/// Collections are read by one thread per shard; the rows are gathered in
/// whatever order the shards deliver them. `LET` and the filters after it
/// run here, on the calling thread.
pub(crate) fn for_each_row<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
    mut sink: impl FnMut(Row) -> Result<Flow, DbError>,
) -> Result<ExecutionStats, DbError> {
    let session = st.session;
    let mut limiter = Limiter::new(p);
    let mut stats = ExecutionStats::default();
    // Skipped rows still run their subqueries.
    if limiter.exhausted() && (limiter.skip == 0 || !p.steps_run_subqueries()) {
        return Ok(stats);
    }
    let bind_vars = session.bind_vars;
    let mut dropped = 0u64;
    let mut offer = |row: Row| -> Result<Flow, DbError> {
        match run_steps(&p.steps, st, row)? {
            Some(row) => limiter.offer(row, &mut sink),
            None => {
                dropped += 1;
                Ok(Flow::Continue)
            }
        }
    };

    match &p.source {
        Source::Singleton => {
            let row = outer.clone();
            if passes(&p.filters, bind_vars, &row)? {
                offer(row)?;
            } else {
                stats.filtered += 1;
            }
        }
        Source::List { variable, expr } => {
            let mut each = |value: Bson| -> Result<Flow, DbError> {
                session.token.check()?;
                let row = outer.clone().with(variable, value);
                if passes(&p.filters, bind_vars, &row)? {
                    offer(row)
                } else {
                    stats.filtered += 1;
                    Ok(Flow::Continue)
                }
            };
            for_each_value(expr, &st.scope(outer), &mut each)?;
        }
        Source::Collection(scan) => {
            stats += gather(p, scan, session, outer, &mut offer)?;
        }
    }
    stats.filtered += dropped;
    Ok(stats)
}

/// Iterates the array `expr` evaluates to. Ranges are produced lazily.
fn for_each_value(
    expr: &Expr,
    scope: &Scope<'_>,
    each: &mut impl FnMut(Bson) -> Result<Flow, DbError>,
) -> Result<(), DbError> {
    if let Expr::Range(lo, hi) = expr {
        let bound = |e: &Expr| -> Result<i64, DbError> {
            let v = e.evaluate(scope)?;
            as_f64(&v)
                .map(|n| n as i64)
                .ok_or_else(|| DbError::BadParameter(format!("range bound must be a number, got {v}")))
        };
        let (lo, hi) = (bound(lo)?, bound(hi)?);
        let values: Box<dyn Iterator<Item = i64>> = if lo <= hi {
            Box::new(lo..=hi)
        } else {
            Box::new((hi..=lo).rev())
        };
        for n in values {
            if each(Bson::Int64(n))? == Flow::Stop {
                break;
            }
        }
        return Ok(());
    }
    match expr.evaluate(scope)? {
        Bson::Array(items) => {
            for item in items {
                if each(item)? == Flow::Stop {
                    break;
                }
            }
            Ok(())
        }
        Bson::Null => Ok(()),
        other => Err(DbError::BadParameter(format!(
            "FOR expects an array, got {other}"
        ))),
    }
}

/// Scatters the scan over the shards and gathers their rows.
fn gather<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    scan: &Scan<S>,
    session: &Session<'_, S>,
    outer: &Row,
    mut sink: impl FnMut(Row) -> Result<Flow, DbError>,
) -> Result<ExecutionStats, DbError> {
    let shards: Vec<usize> = match scan.restricted_to {
        Some(shard) => vec![shard],
        None => (0..scan.collection.number_of_shards()).collect(),
    };
    let capacity = session.channel_capacity();

    std::thread::scope(|scope| {
        let mut receivers: Vec<Receiver<Result<Row, DbError>>> = Vec::with_capacity(shards.len());
        let mut readers = Vec::with_capacity(shards.len());
        for &shard in &shards {
            let (tx, rx) = channel::bounded(capacity);
            receivers.push(rx);
            let store = scan.collection.store(shard);
            let filters = &p.filters;
            let bind_vars = session.bind_vars;
            let token = &session.token;
            readers.push(scope.spawn(move || {
                let mut stats = ExecutionStats::default();
                let result = scan_shard(
                    store,
                    scan,
                    filters,
                    bind_vars,
                    token,
                    outer,
                    &mut stats,
                    |row| {
                        Ok(match tx.send(Ok(row)) {
                            Ok(()) => Flow::Continue,
                            Err(_) => Flow::Stop,
                        })
                    },
                );
                if let Err(e) = result {
                    tracing::debug!(shard, error = %e, "shard reader failed");
                    let _ = tx.send(Err(e));
                }
                stats
            }));
        }

        let mut outcome = Ok(());
        while !receivers.is_empty() {
            let (index, received) = {
                let mut select = Select::new();
                for rx in &receivers {
                    select.recv(rx);
                }
                let op = select.select();
                let index = op.index();
                (index, op.recv(&receivers[index]))
            };
            match received {
                Ok(Ok(row)) => match sink(row) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                },
                Ok(Err(e)) => {
                    outcome = Err(e);
                    break;
                }
                // This shard is done.
                Err(_) => {
                    receivers.remove(index);
                }
            }
        }
        // Unblocks readers still sending.
        drop(receivers);

        let mut stats = ExecutionStats::default();
        for reader in readers {
            match reader.join() {
                Ok(s) => stats += s,
                Err(_) => {
                    outcome = Err(DbError::Internal("shard reader panicked".into()));
                }
            }
        }
        outcome.map(|()| stats)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(limiter: &mut Limiter, rows: usize) -> (usize, usize) {
        let mut delivered = 0;
        let mut offered = 0;
        for _ in 0..rows {
            offered += 1;
            let flow = limiter
                .offer(Row::new(), &mut |_| {
                    delivered += 1;
                    Ok(Flow::Continue)
                })
                .unwrap();
            if flow == Flow::Stop {
                break;
            }
        }
        (offered, delivered)
    }

    #[test]
    fn offset_then_count() {
        let mut limiter = Limiter {
            skip: 2,
            remaining: Some(2),
        };
        assert_eq!(drain(&mut limiter, 10), (4, 2));
    }

    #[test]
    fn zero_count_never_reaches_the_sink() {
        let mut limiter = Limiter {
            skip: 1,
            remaining: Some(0),
        };
        assert_eq!(drain(&mut limiter, 10), (2, 0));
    }

    #[test]
    fn unlimited() {
        let mut limiter = Limiter {
            skip: 0,
            remaining: None,
        };
        assert_eq!(drain(&mut limiter, 5), (5, 5));
    }
}
