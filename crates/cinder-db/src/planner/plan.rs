use std::collections::BTreeMap;

use cinder_query::{Expr, ModificationKind};

use crate::catalog::CollectionHandle;
use crate::config::ModificationOptions;

/// An optimized statement, ready for execution.
pub(crate) struct Plan<S> {
    pub root: Pipeline<S>,
    /// Every subquery of the statement, nested ones included, by the id
    /// the parser gave it.
    pub subqueries: BTreeMap<usize, Pipeline<S>>,
    /// Optimizer rules that changed the plan, in application order.
    pub rules: Vec<&'static str>,
}

impl<S> Plan<S> {
    /// True if any part of the statement writes.
    pub fn is_modification(&self) -> bool {
        self.pipelines().any(|p| p.modification.is_some())
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline<S>> {
        std::iter::once(&self.root).chain(self.subqueries.values())
    }
}

/// One `FOR ... FILTER/LET ... LIMIT ... <modification> ... RETURN` chain.
pub(crate) struct Pipeline<S> {
    pub source: Source<S>,
    /// Leading filters, evaluated where the source is read.
    pub filters: Vec<Expr>,
    /// Remaining `LET` and `FILTER` clauses, evaluated in order on the
    /// coordinator.
    pub steps: Vec<Step>,
    pub limit: Option<Limit>,
    pub modification: Option<ModificationStage<S>>,
    pub output: Output,
    pub in_subquery: bool,
}

impl<S> Pipeline<S> {
    /// True if some step can run a subquery.
    pub fn steps_run_subqueries(&self) -> bool {
        self.steps.iter().any(|step| match step {
            Step::Let { value, .. } => value.contains_subquery(),
            Step::Filter(e) => e.contains_subquery(),
        })
    }
}

pub(crate) enum Step {
    Let { variable: String, value: Expr },
    Filter(Expr),
}

pub(crate) enum Source<S> {
    /// No `FOR`: exactly one empty row.
    Singleton,
    List { variable: String, expr: Expr },
    Collection(Scan<S>),
}

pub(crate) struct Scan<S> {
    pub variable: String,
    pub collection: CollectionHandle<S>,
    /// Primary-index lookup of this `_key` instead of a full scan.
    pub lookup: Option<String>,
    /// Only this shard is enumerated.
    pub restricted_to: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limit {
    pub offset: u64,
    pub count: u64,
}

pub(crate) struct ModificationStage<S> {
    pub op: ModificationKind,
    pub collection: CollectionHandle<S>,
    pub options: ModificationOptions,
    pub routing: Routing,
}

impl<S> ModificationStage<S> {
    pub fn kind(&self) -> ModifyKind {
        ModifyKind::of(&self.op)
    }
}

/// Where the rows of a modification are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routing {
    /// The coordinator computes the owning shard of every row.
    Distribute,
    /// Every row goes to every shard; shards that do not own it ignore it.
    Broadcast,
    /// Each shard modifies the documents it enumerated itself.
    Local,
    /// All rows go to one shard.
    Restricted(usize),
    /// One document on one shard, without FOR, executed atomically.
    SingleOperation(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModifyKind {
    Insert,
    Update,
    Replace,
    Remove,
    Upsert,
}

impl ModifyKind {
    pub fn of(op: &ModificationKind) -> Self {
        match op {
            ModificationKind::Insert { .. } => ModifyKind::Insert,
            ModificationKind::Update { .. } => ModifyKind::Update,
            ModificationKind::Replace { .. } => ModifyKind::Replace,
            ModificationKind::Remove { .. } => ModifyKind::Remove,
            ModificationKind::Upsert { .. } => ModifyKind::Upsert,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModifyKind::Insert => "insert",
            ModifyKind::Update => "update",
            ModifyKind::Replace => "replace",
            ModifyKind::Remove => "remove",
            ModifyKind::Upsert => "upsert",
        }
    }
}

pub(crate) enum Output {
    Discard,
    Return(Expr),
    /// `COLLECT WITH COUNT INTO variable [RETURN ret]`.
    Count {
        variable: String,
        ret: Option<Expr>,
    },
}
