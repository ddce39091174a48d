//! Static analysis of modification selectors.
//!
//! Works out, per shard-key attribute, where the value a modification
//! routes by comes from, and whether it can be known before any row is
//! produced. Both shard-restricting rules and the distribution rules are
//! driven by this.

use std::collections::HashMap;

use bson::{Bson, Document};
use cinder_query::value::{equals, get_path};
use cinder_query::{BinaryOp, Expr, ModificationKind, Row, Scope};

use crate::document::{KEY, extract_key};
use crate::error::DbError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KeySource {
    /// Known at plan time.
    Constant(Bson),
    /// This attribute path of the enumerated document.
    FromSource(String),
    /// Only known once a row is evaluated.
    Computed,
    /// Not provided by the expression at all.
    Missing,
}

impl KeySource {
    pub fn is_missing(&self) -> bool {
        matches!(self, KeySource::Missing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectorShape {
    pub key: KeySource,
    /// One entry per shard-key attribute, in shard-key order.
    pub shard_keys: Vec<(String, KeySource)>,
}

impl SelectorShape {
    pub fn any_missing(&self) -> bool {
        self.shard_keys.iter().any(|(_, s)| s.is_missing())
    }

    pub fn all_from_source(&self) -> bool {
        self.shard_keys
            .iter()
            .all(|(name, s)| matches!(s, KeySource::FromSource(p) if p == name))
    }

    pub fn all_missing(&self) -> bool {
        self.shard_keys.iter().all(|(_, s)| s.is_missing())
    }

    /// Some shard-key attributes are constants while others are read from
    /// the enumerated document.
    pub fn mixes_constants_and_source(&self) -> bool {
        let constant = self
            .shard_keys
            .iter()
            .any(|(_, s)| matches!(s, KeySource::Constant(_)));
        let source = self
            .shard_keys
            .iter()
            .any(|(_, s)| matches!(s, KeySource::FromSource(_)));
        constant && source
    }
}

/// Classifies `_key` and every shard-key attribute of `selector`.
pub(crate) fn analyze(
    selector: &Expr,
    shard_keys: &[String],
    source_var: Option<&str>,
    bind_vars: &Document,
    collection: &str,
) -> Result<SelectorShape, DbError> {
    let key = classify_key(selector, source_var, bind_vars, collection)?;
    let mut keys = Vec::with_capacity(shard_keys.len());
    for name in shard_keys {
        let source = if name == KEY {
            key.clone()
        } else {
            classify(selector, name, source_var, bind_vars)?
        };
        keys.push((name.clone(), source));
    }
    Ok(SelectorShape {
        key,
        shard_keys: keys,
    })
}

/// Where the shard-key values a row is routed by come from.
///
/// UPDATE and REPLACE with a separate `WITH` document route by the shard
/// keys of that document; its `_key` still comes from the key expression.
/// Everything else routes by its selector.
pub(crate) fn routing_shape(
    op: &ModificationKind,
    shard_keys: &[String],
    source_var: Option<&str>,
    bind_vars: &Document,
    collection: &str,
) -> Result<SelectorShape, DbError> {
    let (key, document) = match op {
        ModificationKind::Update {
            key: Some(key),
            document,
        }
        | ModificationKind::Replace {
            key: Some(key),
            document,
        } => (key, document),
        other => {
            return analyze(other.selector(), shard_keys, source_var, bind_vars, collection);
        }
    };
    let key = classify_key(key, source_var, bind_vars, collection)?;
    let mut keys = Vec::with_capacity(shard_keys.len());
    for name in shard_keys {
        let source = if name == KEY {
            key.clone()
        } else {
            classify(document, name, source_var, bind_vars)?
        };
        keys.push((name.clone(), source));
    }
    Ok(SelectorShape {
        key,
        shard_keys: keys,
    })
}

fn evaluate_constant(expr: &Expr, bind_vars: &Document) -> Result<Bson, DbError> {
    let row = Row::new();
    Ok(expr.evaluate(&Scope::new(bind_vars, &row))?)
}

fn is_source_var(expr: &Expr, source_var: Option<&str>) -> bool {
    matches!((expr, source_var), (Expr::Variable(v), Some(s)) if v == s)
}

/// A string-valued selector (`d._key`, `d._id`, `CONCAT(...)`) carries a
/// key and nothing else.
fn string_selector(expr: &Expr, source_var: Option<&str>) -> Option<KeySource> {
    if let Some(var) = source_var
        && let Some(path) = expr.attribute_path_of(var)
        && path.len() == 1
        && (path[0] == "_key" || path[0] == "_id")
    {
        return Some(KeySource::FromSource(KEY.to_string()));
    }
    match expr {
        Expr::Call { name, .. } if name == "CONCAT" || name == "TO_STRING" => {
            Some(KeySource::Computed)
        }
        _ => None,
    }
}

fn classify_key(
    selector: &Expr,
    source_var: Option<&str>,
    bind_vars: &Document,
    collection: &str,
) -> Result<KeySource, DbError> {
    if selector.is_constant() {
        let value = evaluate_constant(selector, bind_vars)?;
        return Ok(match extract_key(&value, collection) {
            Ok(key) => KeySource::Constant(Bson::String(key)),
            Err(_) => KeySource::Missing,
        });
    }
    if is_source_var(selector, source_var) {
        return Ok(KeySource::FromSource(KEY.to_string()));
    }
    if let Some(source) = string_selector(selector, source_var) {
        return Ok(source);
    }
    let Expr::Object(fields) = selector else {
        return Ok(KeySource::Computed);
    };
    if let Some((_, expr)) = fields.iter().find(|(name, _)| name == "_key") {
        return classify_expr(expr, source_var, bind_vars);
    }
    match fields.iter().find(|(name, _)| name == "_id") {
        Some((_, expr)) => Ok(match classify_expr(expr, source_var, bind_vars)? {
            KeySource::Constant(id) => match extract_key(&id, collection) {
                Ok(key) => KeySource::Constant(Bson::String(key)),
                Err(_) => KeySource::Missing,
            },
            KeySource::FromSource(path) if path == "_id" => {
                KeySource::FromSource(KEY.to_string())
            }
            _ => KeySource::Computed,
        }),
        None => Ok(KeySource::Missing),
    }
}

/// Classifies the attribute at dotted `path` of the object `selector`
/// produces.
fn classify(
    selector: &Expr,
    path: &str,
    source_var: Option<&str>,
    bind_vars: &Document,
) -> Result<KeySource, DbError> {
    if selector.is_constant() {
        return Ok(match evaluate_constant(selector, bind_vars)? {
            Bson::Document(doc) => match get_path(&doc, path) {
                Some(v) => KeySource::Constant(v.clone()),
                None => KeySource::Missing,
            },
            _ => KeySource::Missing,
        });
    }
    if is_source_var(selector, source_var) {
        return Ok(KeySource::FromSource(path.to_string()));
    }
    if string_selector(selector, source_var).is_some() {
        return Ok(KeySource::Missing);
    }
    let Expr::Object(fields) = selector else {
        return Ok(KeySource::Computed);
    };
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    // Later duplicates win, as in evaluation.
    let Some((_, expr)) = fields.iter().rev().find(|(name, _)| name == head) else {
        return Ok(KeySource::Missing);
    };
    match rest {
        None => classify_expr(expr, source_var, bind_vars),
        Some(rest) => {
            if let Some(var) = source_var
                && let Some(base) = expr.attribute_path_of(var)
            {
                let mut full = base.join(".");
                if !full.is_empty() {
                    full.push('.');
                }
                full.push_str(rest);
                return Ok(KeySource::FromSource(full));
            }
            classify(expr, rest, source_var, bind_vars)
        }
    }
}

fn classify_expr(
    expr: &Expr,
    source_var: Option<&str>,
    bind_vars: &Document,
) -> Result<KeySource, DbError> {
    if expr.is_constant() {
        return Ok(KeySource::Constant(evaluate_constant(expr, bind_vars)?));
    }
    if let Some(var) = source_var
        && let Some(path) = expr.attribute_path_of(var)
        && !path.is_empty()
    {
        return Ok(KeySource::FromSource(path.join(".")));
    }
    Ok(KeySource::Computed)
}

/// Attributes of `var` that the filters pin to a constant with `==`.
///
/// `_id` pins are translated to `_key` for ids of `collection`.
pub(crate) fn pinned_attributes(
    var: &str,
    filters: &[Expr],
    bind_vars: &Document,
    collection: &str,
) -> Result<HashMap<String, Bson>, DbError> {
    let mut pinned = HashMap::new();
    for filter in filters {
        for conjunct in filter.conjuncts() {
            let Expr::Binary(BinaryOp::Eq, lhs, rhs) = conjunct else {
                continue;
            };
            let (path, value) = match (lhs.attribute_path_of(var), rhs.attribute_path_of(var)) {
                (Some(path), None) if rhs.is_constant() => (path, rhs),
                (None, Some(path)) if lhs.is_constant() => (path, lhs),
                _ => continue,
            };
            if path.is_empty() {
                continue;
            }
            let value = evaluate_constant(value, bind_vars)?;
            let path = path.join(".");
            if path == "_id" {
                if let Ok(key) = extract_key(&value, collection) {
                    pinned.insert(KEY.to_string(), Bson::String(key));
                }
            } else {
                pinned.insert(path, value);
            }
        }
    }
    Ok(pinned)
}

/// The shard-key tuple of `shape`, if every value is known before
/// execution.
///
/// An INSERT that leaves out a custom shard-key attribute stores it as
/// missing, which routes like null.
pub(crate) fn resolve_tuple(
    shape: &SelectorShape,
    pinned: &HashMap<String, Bson>,
    is_insert: bool,
) -> Option<Vec<Bson>> {
    shape
        .shard_keys
        .iter()
        .map(|(name, source)| match source {
            KeySource::Constant(v) => Some(v.clone()),
            KeySource::FromSource(path) => pinned.get(path).cloned(),
            KeySource::Missing if is_insert && name != KEY => Some(Bson::Null),
            KeySource::Missing | KeySource::Computed => None,
        })
        .collect()
}

/// Outcome of comparing an UPDATE/REPLACE document against its selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShardKeyChange {
    Unchanged,
    /// Only known per document at run time.
    Possible,
    /// Known to change from constants alone.
    Certain,
}

/// Whether an UPDATE/REPLACE can change a shard-key attribute of the
/// document it targets.
pub(crate) fn shard_key_change(
    op: &ModificationKind,
    selector: &SelectorShape,
    source_var: Option<&str>,
    bind_vars: &Document,
) -> Result<ShardKeyChange, DbError> {
    let (document, is_replace) = match op {
        ModificationKind::Update { document, .. } => (document, false),
        ModificationKind::Replace { document, .. } => (document, true),
        ModificationKind::Insert { .. }
        | ModificationKind::Remove { .. }
        | ModificationKind::Upsert { .. } => {
            return Ok(ShardKeyChange::Unchanged);
        }
    };
    let mut result = ShardKeyChange::Unchanged;
    for (name, before) in &selector.shard_keys {
        // System attributes of the document are never written.
        if name == KEY {
            continue;
        }
        let after = classify(document, name, source_var, bind_vars)?;
        let change = match (before, &after) {
            (_, KeySource::Missing) if !is_replace => ShardKeyChange::Unchanged,
            (KeySource::Constant(b), KeySource::Missing) => {
                if matches!(b, Bson::Null) {
                    ShardKeyChange::Unchanged
                } else {
                    ShardKeyChange::Certain
                }
            }
            (KeySource::Constant(b), KeySource::Constant(a)) => {
                if equals(a, b) {
                    ShardKeyChange::Unchanged
                } else {
                    ShardKeyChange::Certain
                }
            }
            (KeySource::FromSource(b), KeySource::FromSource(a)) if a == b => {
                ShardKeyChange::Unchanged
            }
            _ => ShardKeyChange::Possible,
        };
        result = match (result, change) {
            (ShardKeyChange::Certain, _) | (_, ShardKeyChange::Certain) => ShardKeyChange::Certain,
            (ShardKeyChange::Possible, _) | (_, ShardKeyChange::Possible) => {
                ShardKeyChange::Possible
            }
            _ => ShardKeyChange::Unchanged,
        };
    }
    Ok(result)
}
