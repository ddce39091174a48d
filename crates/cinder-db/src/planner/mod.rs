mod detector;
pub(crate) mod plan;
pub(crate) mod rules;

use std::collections::BTreeMap;

use bson::{Bson, Document};
use cinder_query::value::as_f64;
use cinder_query::{Clause, Expr, ForSource, ModificationKind, Query, Row, Scope};
use cinder_store::Store;

use crate::config::ModificationOptions;
use crate::document::{as_object, extract_key, requested_key};
use crate::error::DbError;
use crate::session::Session;

use detector::{ShardKeyChange, analyze, shard_key_change};
use plan::{Limit, ModificationStage, Output, Pipeline, Plan, Routing, Scan, Source, Step};

pub(crate) use rules::RuleSet;

/// Builds the plan of a parsed query and runs the optimizer over it.
pub(crate) fn plan<S: Store>(query: &Query, session: &Session<'_, S>) -> Result<Plan<S>, DbError> {
    let mut subqueries = BTreeMap::new();
    let mut root = build_pipeline(query, session, false, &mut subqueries)?;
    let mut rules = rules::optimize(&mut root, session)?;
    for pipeline in subqueries.values_mut() {
        for rule in rules::optimize(pipeline, session)? {
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }
    let plan = Plan {
        root,
        subqueries,
        rules,
    };
    modified_once(&plan)?;
    tracing::debug!(rules = ?plan.rules, subqueries = plan.subqueries.len(), "planned query");
    Ok(plan)
}

/// A collection is the target of at most one data-modification operation
/// per statement; shard writers keep their transaction until the statement
/// ends.
fn modified_once<S: Store>(plan: &Plan<S>) -> Result<(), DbError> {
    let mut modified: Vec<&str> = Vec::new();
    for pipeline in plan.pipelines() {
        if let Some(m) = &pipeline.modification {
            let name = m.collection.name();
            if modified.contains(&name) {
                return Err(DbError::AccessAfterModification(name.to_string()));
            }
            modified.push(name);
        }
    }
    Ok(())
}

fn constant(expr: &Expr, bind_vars: &Document) -> Result<Bson, DbError> {
    let row = Row::new();
    Ok(expr.evaluate(&Scope::new(bind_vars, &row))?)
}

fn limit_value(expr: &Expr, bind_vars: &Document) -> Result<u64, DbError> {
    let invalid = || DbError::BadParameter("LIMIT value must be a non-negative number".into());
    if !expr.is_constant() {
        return Err(invalid());
    }
    match as_f64(&constant(expr, bind_vars)?) {
        Some(n) if n.is_finite() && n >= 0.0 => Ok(n as u64),
        _ => Err(invalid()),
    }
}

fn build_pipeline<S: Store>(
    query: &Query,
    session: &Session<'_, S>,
    in_subquery: bool,
    subqueries: &mut BTreeMap<usize, Pipeline<S>>,
) -> Result<Pipeline<S>, DbError> {
    for expr in query.expressions() {
        for (id, inner) in expr.subqueries() {
            let pipeline = build_pipeline(inner, session, true, subqueries)?;
            subqueries.insert(id, pipeline);
        }
    }

    let source = match &query.for_clause {
        None => Source::Singleton,
        Some(f) => match &f.source {
            ForSource::Collection(coll) => Source::Collection(Scan {
                variable: f.variable.clone(),
                collection: session.collection(coll)?,
                lookup: None,
                restricted_to: None,
            }),
            ForSource::Expr(expr) => Source::List {
                variable: f.variable.clone(),
                expr: expr.clone(),
            },
        },
    };
    let source_var = query.for_clause.as_ref().map(|f| f.variable.as_str());

    // Filters ahead of the first LET or subquery run where the source is
    // read; everything from there on runs on the coordinator.
    let leading = query
        .clauses
        .iter()
        .take_while(|c| matches!(c, Clause::Filter(e) if !e.contains_subquery()))
        .count();
    let filters = query.clauses[..leading]
        .iter()
        .filter_map(|c| match c {
            Clause::Filter(e) => Some(e.clone()),
            Clause::Let { .. } => None,
        })
        .collect();
    let steps = query.clauses[leading..]
        .iter()
        .map(|c| match c {
            Clause::Let { variable, value } => Step::Let {
                variable: variable.clone(),
                value: value.clone(),
            },
            Clause::Filter(e) => Step::Filter(e.clone()),
        })
        .collect();

    let limit = match &query.limit {
        Some(l) => Some(Limit {
            offset: match &l.offset {
                Some(e) => limit_value(e, session.bind_vars)?,
                None => 0,
            },
            count: limit_value(&l.count, session.bind_vars)?,
        }),
        None => None,
    };

    let output = match (&query.count_into, &query.ret) {
        (Some(variable), ret) => Output::Count {
            variable: variable.clone(),
            ret: ret.clone(),
        },
        (None, Some(ret)) => Output::Return(ret.clone()),
        (None, None) => Output::Discard,
    };

    let modification = match &query.modification {
        None => None,
        Some(m) => {
            let collection = session.collection(&m.collection)?;
            let options = match &m.options {
                None => ModificationOptions::default(),
                Some(e) if e.is_constant() => {
                    ModificationOptions::from_bson(constant(e, session.bind_vars)?)?
                }
                Some(_) => {
                    return Err(DbError::BadParameter(
                        "OPTIONS must be a constant object".into(),
                    ));
                }
            };
            let stage = ModificationStage {
                op: m.kind.clone(),
                collection,
                options,
                routing: Routing::Broadcast,
            };
            static_checks(&stage, source_var, session.bind_vars)?;
            Some(stage)
        }
    };

    Ok(Pipeline {
        source,
        filters,
        steps,
        limit,
        modification,
        output,
        in_subquery,
    })
}

/// Errors detectable from constants alone, raised before anything runs.
fn static_checks<S: Store>(
    m: &ModificationStage<S>,
    source_var: Option<&str>,
    bind_vars: &Document,
) -> Result<(), DbError> {
    let name = m.collection.name();
    if !m.options.ignore_errors {
        match &m.op {
            ModificationKind::Insert { document } => {
                if document.is_constant() {
                    requested_key(&as_object(constant(document, bind_vars)?)?)?;
                }
            }
            ModificationKind::Upsert {
                search,
                insert,
                update,
                ..
            } => {
                for body in [search, insert, update] {
                    if body.is_constant() {
                        as_object(constant(body, bind_vars)?)?;
                    }
                }
                if insert.is_constant() {
                    requested_key(&as_object(constant(insert, bind_vars)?)?)?;
                }
            }
            op => {
                let selector = op.selector();
                if selector.is_constant() {
                    extract_key(&constant(selector, bind_vars)?, name)?;
                }
                if let Some(document) = op.document()
                    && document.is_constant()
                {
                    as_object(constant(document, bind_vars)?)?;
                }
            }
        }
    }

    let shape = analyze(
        m.op.selector(),
        m.collection.shard_keys(),
        source_var,
        bind_vars,
        name,
    )?;
    if shard_key_change(&m.op, &shape, source_var, bind_vars)? == ShardKeyChange::Certain {
        return Err(DbError::MustNotChangeShardingAttributes);
    }
    Ok(())
}
