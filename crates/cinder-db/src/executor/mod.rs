mod modify;
mod source;
mod statement;
mod upsert;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use bson::Bson;
use cinder_query::{Expr, ModificationKind, Row, Subqueries};
use cinder_store::Store;
use crossbeam::channel::{self, Receiver, Sender};

use crate::document::{KEY, extract_key};
use crate::error::{DbError, QueryFailure};
use crate::planner::plan::{ModificationStage, ModifyKind, Output, Pipeline, Plan, Routing, Source};
use crate::session::Session;
use crate::stats::ExecutionStats;

use modify::{WorkItem, WriteContext, WriteOutcome, assign_key};
use source::Flow;
use statement::Statement;
use worker::{Event, ShardWriter, Worker, Written, project};

/// Result rows and statistics of a statement.
pub(crate) struct QueryOutput {
    pub rows: Vec<Bson>,
    pub stats: ExecutionStats,
}

pub(crate) fn execute<S: Store + Send + Sync>(
    plan: &Plan<S>,
    session: &Session<'_, S>,
) -> Result<QueryOutput, QueryFailure> {
    let st = Statement::new(session, &plan.subqueries);
    let result = run(&plan.root, &st, &Row::new());
    st.finish(result)
}

/// Runs one pipeline. Its rows extend `outer`, the row of the expression
/// that called it for a subquery.
fn run<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let Some(m) = &p.modification else {
        return read_only(p, st, outer);
    };
    tracing::debug!(
        op = m.kind().as_str(),
        collection = m.collection.name(),
        routing = ?m.routing,
        subquery = p.in_subquery,
        "executing modification"
    );
    if m.kind() == ModifyKind::Upsert {
        return upsert::run(p, m, st, outer);
    }
    match m.routing {
        Routing::SingleOperation(shard) => single_operation(p, m, shard, st, outer),
        Routing::Local => local(p, m, st, outer),
        Routing::Distribute | Routing::Broadcast | Routing::Restricted(_) => {
            distributed(p, m, st, outer)
        }
    }
}

fn count_rows<S: Store + Send + Sync>(
    variable: &str,
    ret: Option<&Expr>,
    count: u64,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<Vec<Bson>, DbError> {
    let Some(ret) = ret else {
        return Ok(Vec::new());
    };
    let row = outer.clone().with(variable, Bson::Int64(count as i64));
    Ok(vec![ret.evaluate(&st.scope(&row))?])
}

/// Evaluates `RETURN` for rows written by shard workers, in row order.
fn project_all<S: Store + Send + Sync>(
    output: &Output,
    st: &Statement<'_, '_, S>,
    written: impl IntoIterator<Item = Written>,
) -> Result<Vec<Bson>, DbError> {
    let mut rows = Vec::new();
    for w in written {
        if let Some(value) = project(output, st.session.bind_vars, Some(st as &dyn Subqueries), w)? {
            rows.push(value);
        }
    }
    Ok(rows)
}

fn read_only<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let mut rows = Vec::new();
    let mut count = 0u64;
    let stats = source::for_each_row(p, st, outer, |row| {
        match &p.output {
            Output::Return(expr) => rows.push(expr.evaluate(&st.scope(&row))?),
            Output::Count { .. } => count += 1,
            Output::Discard => {}
        }
        Ok(Flow::Continue)
    })?;
    if let Output::Count { variable, ret } = &p.output {
        rows = count_rows(variable, ret.as_ref(), count, st, outer)
            .map_err(|e| QueryFailure::new(e, stats))?;
    }
    Ok(QueryOutput { rows, stats })
}

fn write_context<'a, S: Store>(
    m: &'a ModificationStage<S>,
    session: &'a Session<'_, S>,
) -> WriteContext<'a> {
    WriteContext {
        kind: m.kind(),
        collection: m.collection.name(),
        shard_map: m.collection.shard_map(),
        options: &m.options,
        keys: session.keys,
    }
}

fn shard_worker<'a, S: Store>(
    p: &'a Pipeline<S>,
    m: &'a ModificationStage<S>,
    session: &'a Session<'_, S>,
    abort: &'a AtomicBool,
) -> Worker<'a, S> {
    Worker {
        collection: &m.collection,
        write: write_context(m, session),
        output: &p.output,
        bind_vars: session.bind_vars,
        token: &session.token,
        abort,
        wait_for_sync: m.options.wait_for_sync,
        commit_every: session.intermediate_commit_count(),
    }
}

/// Drains worker events and assembles the statement result.
fn collect<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
    events: Receiver<Event>,
    mut stats: ExecutionStats,
    mut error: Option<DbError>,
) -> Result<QueryOutput, QueryFailure> {
    let mut outputs = Vec::new();
    for event in events.iter() {
        match event {
            Event::Output {
                seq,
                shard,
                written,
            } => outputs.push(((seq, shard), written)),
            Event::Finished {
                shard,
                stats: shard_stats,
                error: shard_error,
            } => {
                tracing::trace!(shard, failed = shard_error.is_some(), "shard finished");
                stats += shard_stats;
                if error.is_none() {
                    error = shard_error;
                }
            }
        }
    }
    if let Some(e) = error {
        return Err(QueryFailure::new(e, stats));
    }
    outputs.sort_by_key(|(order, _)| *order);
    let rows = match &p.output {
        Output::Discard => Ok(Vec::new()),
        Output::Return(_) => project_all(&p.output, st, outputs.into_iter().filter_map(|(_, w)| w)),
        Output::Count { variable, ret } => {
            count_rows(variable, ret.as_ref(), outputs.len() as u64, st, outer)
        }
    };
    match rows {
        Ok(rows) => Ok(QueryOutput { rows, stats }),
        Err(e) => Err(QueryFailure::new(e, stats)),
    }
}

/// One document, one shard, one transaction; no threads involved.
fn single_operation<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    m: &ModificationStage<S>,
    shard: usize,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let session = st.session;
    session.token.check()?;
    let row = outer.clone();
    let scope = st.scope(&row);
    let selector = m.op.selector().evaluate(&scope).map_err(DbError::from)?;
    let document = match m.kind() {
        ModifyKind::Insert | ModifyKind::Remove | ModifyKind::Upsert => None,
        ModifyKind::Update | ModifyKind::Replace => m
            .op
            .document()
            .map(|d| d.evaluate(&scope))
            .transpose()
            .map_err(DbError::from)?,
    };
    let item = WorkItem {
        seq: 0,
        row: row.clone(),
        selector,
        document,
        speculative: false,
    };

    let ctx = write_context(m, session);
    let mut writer = ShardWriter::new(m.collection.store(shard), m.options.wait_for_sync, None);
    let outcome = match writer.write(&ctx, &item) {
        Ok(outcome) => outcome,
        Err(e) => {
            writer.rollback();
            return Err(e.into());
        }
    };
    writer.commit()?;
    let stats = writer.committed();
    let (executed, written) = match outcome {
        WriteOutcome::Executed { old, new } => (
            1,
            Some(Written {
                row: item.row,
                old,
                new,
            }),
        ),
        WriteOutcome::Ignored => (0, None),
    };
    let rows = match &p.output {
        Output::Count { variable, ret } => count_rows(variable, ret.as_ref(), executed, st, outer),
        _ => project_all(&p.output, st, written),
    };
    match rows {
        Ok(rows) => Ok(QueryOutput { rows, stats }),
        Err(e) => Err(QueryFailure::new(e, stats)),
    }
}

/// Every shard enumerates and modifies its own documents.
fn local<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    m: &ModificationStage<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let Source::Collection(scan) = &p.source else {
        return Err(DbError::Internal("local modification without collection source".into()).into());
    };
    let shards: Vec<usize> = match scan.restricted_to {
        Some(shard) => vec![shard],
        None => (0..scan.collection.number_of_shards()).collect(),
    };
    let abort = AtomicBool::new(false);
    let worker = shard_worker(p, m, st.session, &abort);
    let (events_tx, events_rx) = channel::unbounded();

    thread::scope(|scope| {
        for &shard in &shards {
            let events = events_tx.clone();
            let worker = &worker;
            scope.spawn(move || worker.run_local(shard, p, outer, events));
        }
    });
    drop(events_tx);

    collect(p, st, outer, events_rx, ExecutionStats::default(), None)
}

enum Target {
    Shard(usize),
    /// Every shard the statement writes to.
    All,
}

/// Evaluates modification rows on the coordinator and hands them to the
/// owning shard workers.
struct Router<'a, 'b, 's, S> {
    m: &'a ModificationStage<S>,
    st: &'a Statement<'b, 's, S>,
    inputs: &'a [Option<Sender<WorkItem>>],
    targets: &'a [usize],
}

impl<S: Store + Send + Sync> Router<'_, '_, '_, S> {
    fn target(&self, selector: &mut Bson, document: Option<&Bson>) -> Result<Target, DbError> {
        let m = self.m;
        let map = m.collection.shard_map();
        match m.routing {
            Routing::Restricted(shard) => return Ok(Target::Shard(shard)),
            Routing::Distribute => {}
            _ => return Ok(Target::All),
        }
        if m.kind() == ModifyKind::Insert {
            let Bson::Document(body) = selector else {
                return Err(DbError::DocumentTypeInvalid(
                    "expecting object for insert".into(),
                ));
            };
            return Ok(Target::Shard(if map.uses_default_sharding() {
                let key = assign_key(body, self.st.session.keys)?;
                map.shard_index(&[Bson::String(key)])
            } else {
                map.shard_index_of(body)
            }));
        }
        if map.uses_default_sharding() {
            let key = extract_key(selector, m.collection.name())?;
            return Ok(Target::Shard(map.shard_index(&[Bson::String(key)])));
        }
        // With a separate key expression the shard keys come from the
        // WITH document and only `_key` from the key.
        let routed = match (&m.op, document) {
            (
                ModificationKind::Update { key: Some(_), .. }
                | ModificationKind::Replace { key: Some(_), .. },
                Some(Bson::Document(body)),
            ) => {
                let mut body = body.clone();
                if let Ok(key) = extract_key(selector, m.collection.name()) {
                    body.insert(KEY, key);
                }
                Some(body)
            }
            (
                ModificationKind::Update { key: Some(_), .. }
                | ModificationKind::Replace { key: Some(_), .. },
                _,
            ) => None,
            (_, _) => match selector {
                Bson::Document(doc) => Some(doc.clone()),
                _ => None,
            },
        };
        Ok(match routed.and_then(|doc| map.complete_key_tuple(&doc)) {
            Some(tuple) => Target::Shard(map.shard_index(&tuple)),
            None => Target::All,
        })
    }

    fn send(&self, shard: usize, item: WorkItem) -> Result<Flow, DbError> {
        let Some(input) = self.inputs.get(shard).and_then(Option::as_ref) else {
            return Err(DbError::Internal(format!("no worker for shard {shard}")));
        };
        // A closed input means the worker stopped; it reports why.
        Ok(match input.send(item) {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        })
    }

    fn route(&self, seq: u64, row: Row, ignored: &mut u64) -> Result<Flow, DbError> {
        let m = self.m;
        let scope = self.st.scope(&row);
        let mut selector = m.op.selector().evaluate(&scope)?;
        let document = match m.kind() {
            ModifyKind::Insert | ModifyKind::Remove | ModifyKind::Upsert => None,
            ModifyKind::Update | ModifyKind::Replace => {
                m.op.document().map(|d| d.evaluate(&scope)).transpose()?
            }
        };
        let target = match self.target(&mut selector, document.as_ref()) {
            Ok(target) => target,
            Err(e) if m.options.ignore_errors && e.is_document_error() => {
                *ignored += 1;
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };
        let mut item = WorkItem {
            seq,
            row,
            selector,
            document,
            speculative: false,
        };
        match target {
            Target::Shard(shard) => self.send(shard, item),
            Target::All => {
                item.speculative = self.targets.len() > 1;
                for &shard in self.targets {
                    if self.send(shard, item.clone())? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }
}

/// Rows come from the coordinator and are shipped to shard workers.
fn distributed<S: Store + Send + Sync>(
    p: &Pipeline<S>,
    m: &ModificationStage<S>,
    st: &Statement<'_, '_, S>,
    outer: &Row,
) -> Result<QueryOutput, QueryFailure> {
    let session = st.session;
    let number_of_shards = m.collection.number_of_shards();
    let targets: Vec<usize> = match m.routing {
        Routing::Restricted(shard) => vec![shard],
        _ => (0..number_of_shards).collect(),
    };
    let abort = AtomicBool::new(false);
    let worker = shard_worker(p, m, session, &abort);
    let (events_tx, events_rx) = channel::unbounded();
    let mut ignored = 0u64;

    let coordinated = thread::scope(|scope| {
        let mut inputs: Vec<Option<Sender<WorkItem>>> = vec![None; number_of_shards];
        for &shard in &targets {
            let (tx, rx) = channel::bounded(session.channel_capacity());
            inputs[shard] = Some(tx);
            let events = events_tx.clone();
            let worker = &worker;
            scope.spawn(move || worker.run(shard, rx, events));
        }

        let router = Router {
            m,
            st,
            inputs: &inputs,
            targets: &targets,
        };
        let mut seq = 0u64;
        let result = source::for_each_row(p, st, outer, |row| {
            if worker.aborted() {
                return Ok(Flow::Stop);
            }
            session.token.check()?;
            seq += 1;
            router.route(seq, row, &mut ignored)
        });
        if result.is_err() {
            abort.store(true, Ordering::Release);
        }
        // Closing the inputs lets the workers commit and finish.
        drop(inputs);
        result
    });
    drop(events_tx);

    let mut stats = ExecutionStats {
        writes_ignored: ignored,
        ..ExecutionStats::default()
    };
    let error = match coordinated {
        Ok(scanned) => {
            stats += scanned;
            None
        }
        Err(e) => Some(e),
    };
    collect(p, st, outer, events_rx, stats, error)
}
