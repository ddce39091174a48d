use std::collections::HashMap;

use bson::Bson;
use cinder_query::Expr;
use cinder_store::Store;

use super::detector::{
    KeySource, ShardKeyChange, analyze, pinned_attributes, resolve_tuple, routing_shape,
    shard_key_change,
};
use super::plan::{ModifyKind, Output, Pipeline, Routing, Source};
use crate::document::KEY;
use crate::error::DbError;
use crate::session::Session;

pub const USE_INDEXES: &str = "use-indexes";
pub const SCATTER_IN_CLUSTER: &str = "scatter-in-cluster";
pub const DISTRIBUTE_IN_CLUSTER: &str = "distribute-in-cluster";
pub const UNDISTRIBUTE_REMOVE_AFTER_ENUM_COLL: &str = "undistribute-remove-after-enum-coll";
pub const RESTRICT_TO_SINGLE_SHARD: &str = "restrict-to-single-shard";
pub const OPTIMIZE_SINGLE_DOCUMENT_OPERATIONS: &str =
    "optimize-cluster-single-document-operations";

/// Which optimizer rules a query allows, from `optimizer.rules`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RuleSet {
    all_disabled: bool,
    overrides: HashMap<String, bool>,
}

impl RuleSet {
    /// Entries apply in order; later ones win. Unknown names are kept but
    /// never match a rule.
    pub fn from_options(rules: &[String]) -> Self {
        let mut set = RuleSet::default();
        for entry in rules {
            let (enable, name) = match entry.as_bytes().first() {
                Some(b'-') => (false, &entry[1..]),
                Some(b'+') => (true, &entry[1..]),
                _ => (true, entry.as_str()),
            };
            if name == "all" {
                set.all_disabled = !enable;
                set.overrides.clear();
            } else {
                set.overrides.insert(name.to_string(), enable);
            }
        }
        set
    }

    pub fn is_enabled(&self, name: &str, can_be_disabled: bool) -> bool {
        !can_be_disabled
            || self
                .overrides
                .get(name)
                .copied()
                .unwrap_or(!self.all_disabled)
    }
}

type ApplyFn<S> = fn(&mut Pipeline<S>, &Session<'_, S>) -> Result<bool, DbError>;

struct Rule<S> {
    name: &'static str,
    can_be_disabled: bool,
    apply: ApplyFn<S>,
}

/// All rules, in the order they run.
fn rules<S: Store>() -> [Rule<S>; 6] {
    [
        Rule {
            name: USE_INDEXES,
            can_be_disabled: true,
            apply: use_indexes,
        },
        Rule {
            name: SCATTER_IN_CLUSTER,
            can_be_disabled: false,
            apply: scatter_in_cluster,
        },
        Rule {
            name: DISTRIBUTE_IN_CLUSTER,
            can_be_disabled: false,
            apply: distribute_in_cluster,
        },
        Rule {
            name: UNDISTRIBUTE_REMOVE_AFTER_ENUM_COLL,
            can_be_disabled: true,
            apply: undistribute_remove_after_enum_coll,
        },
        Rule {
            name: RESTRICT_TO_SINGLE_SHARD,
            can_be_disabled: true,
            apply: restrict_to_single_shard,
        },
        Rule {
            name: OPTIMIZE_SINGLE_DOCUMENT_OPERATIONS,
            can_be_disabled: true,
            apply: optimize_single_document_operations,
        },
    ]
}

/// Runs every enabled rule once over a pipeline and returns the names of
/// those that changed it.
pub(crate) fn optimize<S: Store>(
    pipeline: &mut Pipeline<S>,
    session: &Session<'_, S>,
) -> Result<Vec<&'static str>, DbError> {
    let mut applied = Vec::new();
    for rule in rules::<S>() {
        if !session.rules.is_enabled(rule.name, rule.can_be_disabled) {
            tracing::trace!(rule = rule.name, "rule disabled");
            continue;
        }
        if (rule.apply)(pipeline, session)? {
            applied.push(rule.name);
        }
    }
    Ok(applied)
}

fn source_var<S>(p: &Pipeline<S>) -> Option<&str> {
    match &p.source {
        Source::Singleton => None,
        Source::List { variable, .. } => Some(variable),
        Source::Collection(scan) => Some(&scan.variable),
    }
}

fn pinned<S: Store>(
    p: &Pipeline<S>,
    session: &Session<'_, S>,
    fallback_collection: &str,
) -> Result<HashMap<String, Bson>, DbError> {
    match &p.source {
        Source::Singleton => Ok(HashMap::new()),
        Source::List { variable, .. } => {
            pinned_attributes(variable, &p.filters, session.bind_vars, fallback_collection)
        }
        Source::Collection(scan) => pinned_attributes(
            &scan.variable,
            &p.filters,
            session.bind_vars,
            scan.collection.name(),
        ),
    }
}

/// Enumerates the collection the modification writes to, with operands
/// that shard workers can evaluate on their own.
fn enumerates_target<S: Store>(p: &Pipeline<S>) -> bool {
    match (&p.source, &p.modification) {
        (Source::Collection(scan), Some(m)) => {
            scan.collection.name() == m.collection.name()
                && !m.op.expressions().iter().any(|e| e.contains_subquery())
        }
        _ => false,
    }
}

// ── Rules ───────────────────────────────────────────────────

fn use_indexes<S: Store>(p: &mut Pipeline<S>, session: &Session<'_, S>) -> Result<bool, DbError> {
    let Source::Collection(scan) = &mut p.source else {
        return Ok(false);
    };
    if scan.lookup.is_some() {
        return Ok(false);
    }
    let pinned = pinned_attributes(
        &scan.variable,
        &p.filters,
        session.bind_vars,
        scan.collection.name(),
    )?;
    match pinned.get(KEY) {
        Some(Bson::String(key)) => {
            scan.lookup = Some(key.clone());
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn scatter_in_cluster<S: Store>(
    p: &mut Pipeline<S>,
    _session: &Session<'_, S>,
) -> Result<bool, DbError> {
    let touches_collection = matches!(p.source, Source::Collection(_)) || p.modification.is_some();
    let local = enumerates_target(p)
        && p.limit.is_none()
        && p.steps.is_empty()
        && p.modification.as_ref().is_some_and(|m| {
            matches!(m.kind(), ModifyKind::Update | ModifyKind::Replace)
                && matches!(m.op.selector(), Expr::Variable(v) if Some(v.as_str()) == source_var(p))
        });
    if let Some(m) = &mut p.modification {
        m.routing = if local {
            Routing::Local
        } else {
            Routing::Broadcast
        };
    }
    Ok(touches_collection)
}

fn distribute_in_cluster<S: Store>(
    p: &mut Pipeline<S>,
    session: &Session<'_, S>,
) -> Result<bool, DbError> {
    let var = source_var(p).map(str::to_owned);
    let Some(m) = &mut p.modification else {
        return Ok(false);
    };
    if m.routing != Routing::Broadcast {
        return Ok(false);
    }
    let per_row = if matches!(m.kind(), ModifyKind::Insert | ModifyKind::Upsert)
        || m.collection.shard_map().uses_default_sharding()
    {
        true
    } else {
        let shape = routing_shape(
            &m.op,
            m.collection.shard_keys(),
            var.as_deref(),
            session.bind_vars,
            m.collection.name(),
        )?;
        !shape.any_missing() && !shape.mixes_constants_and_source()
    };
    if per_row {
        m.routing = Routing::Distribute;
    }
    Ok(per_row)
}

fn undistribute_remove_after_enum_coll<S: Store>(
    p: &mut Pipeline<S>,
    session: &Session<'_, S>,
) -> Result<bool, DbError> {
    if !enumerates_target(p) || p.limit.is_some() || !p.steps.is_empty() {
        return Ok(false);
    }
    let var = source_var(p).map(str::to_owned);
    let Some(m) = &mut p.modification else {
        return Ok(false);
    };
    if m.kind() != ModifyKind::Remove
        || !matches!(m.routing, Routing::Distribute | Routing::Broadcast)
    {
        return Ok(false);
    }
    let shape = analyze(
        m.op.selector(),
        m.collection.shard_keys(),
        var.as_deref(),
        session.bind_vars,
        m.collection.name(),
    )?;
    let key_from_source = matches!(&shape.key, KeySource::FromSource(p) if p == KEY);
    if key_from_source && (shape.all_from_source() || shape.all_missing()) {
        m.routing = Routing::Local;
        return Ok(true);
    }
    Ok(false)
}

fn restrict_to_single_shard<S: Store>(
    p: &mut Pipeline<S>,
    session: &Session<'_, S>,
) -> Result<bool, DbError> {
    let mut applied = false;

    let scan_shard = match &p.source {
        Source::Collection(scan) if scan.restricted_to.is_none() => {
            let pinned = pinned(p, session, scan.collection.name())?;
            let map = scan.collection.shard_map();
            map.shard_keys()
                .iter()
                .map(|k| pinned.get(k).cloned())
                .collect::<Option<Vec<_>>>()
                .map(|tuple| map.shard_index(&tuple))
        }
        _ => None,
    };
    if let (Some(shard), Source::Collection(scan)) = (scan_shard, &mut p.source) {
        scan.restricted_to = Some(shard);
        applied = true;
    }

    // Inserts on custom shard keys and upserts keep their distribution.
    let target = match &p.modification {
        Some(m) if m.kind() == ModifyKind::Upsert => None,
        Some(m)
            if m.kind() == ModifyKind::Insert
                && !m.collection.shard_map().uses_default_sharding() =>
        {
            None
        }
        Some(m) if matches!(m.routing, Routing::Distribute | Routing::Broadcast) => {
            let var = source_var(p);
            let shape = analyze(
                m.op.selector(),
                m.collection.shard_keys(),
                var,
                session.bind_vars,
                m.collection.name(),
            )?;
            let pinned = pinned(p, session, m.collection.name())?;
            let unchanged = shard_key_change(&m.op, &shape, var, session.bind_vars)?
                == ShardKeyChange::Unchanged;
            resolve_tuple(&shape, &pinned, m.kind() == ModifyKind::Insert)
                .filter(|_| unchanged)
                .map(|tuple| m.collection.shard_map().shard_index(&tuple))
        }
        _ => None,
    };
    if let (Some(shard), Some(m)) = (target, &mut p.modification) {
        m.routing = Routing::Restricted(shard);
        applied = true;
    }

    Ok(applied)
}

fn optimize_single_document_operations<S: Store>(
    p: &mut Pipeline<S>,
    session: &Session<'_, S>,
) -> Result<bool, DbError> {
    if p.in_subquery
        || !matches!(p.source, Source::Singleton)
        || !p.filters.is_empty()
        || !p.steps.is_empty()
        || p.limit.is_some()
        || matches!(p.output, Output::Count { .. })
    {
        return Ok(false);
    }
    let Some(m) = &mut p.modification else {
        return Ok(false);
    };
    if m.kind() == ModifyKind::Upsert
        || matches!(m.routing, Routing::Local | Routing::SingleOperation(_))
    {
        return Ok(false);
    }
    let shape = analyze(
        m.op.selector(),
        m.collection.shard_keys(),
        None,
        session.bind_vars,
        m.collection.name(),
    )?;
    let is_insert = m.kind() == ModifyKind::Insert;
    if !is_insert && !matches!(shape.key, KeySource::Constant(_)) {
        return Ok(false);
    }
    if shard_key_change(&m.op, &shape, None, session.bind_vars)? != ShardKeyChange::Unchanged {
        return Ok(false);
    }
    match resolve_tuple(&shape, &HashMap::new(), is_insert) {
        Some(tuple) => {
            m.routing = Routing::SingleOperation(m.collection.shard_map().shard_index(&tuple));
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> RuleSet {
        RuleSet::from_options(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn everything_enabled_by_default() {
        let rules = set(&[]);
        assert!(rules.is_enabled(RESTRICT_TO_SINGLE_SHARD, true));
    }

    #[test]
    fn disable_single_rule() {
        let rules = set(&["-restrict-to-single-shard"]);
        assert!(!rules.is_enabled(RESTRICT_TO_SINGLE_SHARD, true));
        assert!(rules.is_enabled(USE_INDEXES, true));
    }

    #[test]
    fn disable_all_then_enable_one() {
        let rules = set(&["-all", "+use-indexes"]);
        assert!(rules.is_enabled(USE_INDEXES, true));
        assert!(!rules.is_enabled(OPTIMIZE_SINGLE_DOCUMENT_OPERATIONS, true));
    }

    #[test]
    fn mandatory_rules_cannot_be_disabled() {
        let rules = set(&["-all", "-scatter-in-cluster"]);
        assert!(rules.is_enabled(SCATTER_IN_CLUSTER, false));
    }

    #[test]
    fn later_entries_win() {
        let rules = set(&["-use-indexes", "+all"]);
        assert!(rules.is_enabled(USE_INDEXES, true));
    }
}
