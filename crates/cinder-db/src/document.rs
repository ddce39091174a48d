use bson::{Bson, Document};

use crate::catalog::validate_key;
use crate::error::DbError;

pub(crate) const KEY: &str = "_key";
pub(crate) const ID: &str = "_id";
pub(crate) const REV: &str = "_rev";

fn is_system(name: &str) -> bool {
    matches!(name, KEY | ID | REV)
}

// ── Storage encoding ────────────────────────────────────────

pub(crate) fn encode(doc: &Document) -> Result<Vec<u8>, DbError> {
    Ok(bson::serialize_to_vec(doc)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Document, DbError> {
    Ok(bson::deserialize_from_slice(bytes)?)
}

// ── Selectors ───────────────────────────────────────────────

/// The `_key` a modification selector refers to.
///
/// Objects use their `_key` (or, failing that, their `_id`); strings are
/// keys or `collection/key` ids of this collection.
pub(crate) fn extract_key(selector: &Bson, collection: &str) -> Result<String, DbError> {
    match selector {
        Bson::Document(doc) => match doc.get(KEY) {
            Some(Bson::String(key)) => Ok(key.clone()),
            Some(other) => Err(DbError::DocumentTypeInvalid(format!(
                "_key must be a string, got {other}"
            ))),
            None => match doc.get(ID) {
                Some(Bson::String(id)) => key_from_id(id, collection),
                _ => Err(DbError::DocumentKeyMissing),
            },
        },
        Bson::String(s) if s.contains('/') => key_from_id(s, collection),
        Bson::String(key) => Ok(key.clone()),
        _ => Err(DbError::DocumentKeyMissing),
    }
}

fn key_from_id(id: &str, collection: &str) -> Result<String, DbError> {
    match id.split_once('/') {
        Some((coll, key)) if coll == collection => Ok(key.to_string()),
        _ => Err(DbError::DocumentKeyBad(id.to_string())),
    }
}

/// `_rev` carried by an object selector.
pub(crate) fn extract_rev(selector: &Bson) -> Option<&str> {
    match selector {
        Bson::Document(doc) => match doc.get(REV) {
            Some(Bson::String(rev)) => Some(rev),
            _ => None,
        },
        _ => None,
    }
}

/// The `_key` an INSERT body asks for, if any.
pub(crate) fn requested_key(body: &Document) -> Result<Option<String>, DbError> {
    match body.get(KEY) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(key)) => {
            validate_key(key)?;
            Ok(Some(key.clone()))
        }
        Some(other) => Err(DbError::DocumentKeyBad(other.to_string())),
    }
}

pub(crate) fn as_object(value: Bson) -> Result<Document, DbError> {
    match value {
        Bson::Document(doc) => Ok(doc),
        other => Err(DbError::DocumentTypeInvalid(format!(
            "expecting object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null | Bson::Undefined => "null",
        Bson::Boolean(_) => "bool",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => "number",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        _ => "value",
    }
}

// ── Building stored documents ───────────────────────────────

/// `body` with fresh system attributes placed first.
pub(crate) fn with_system(key: &str, collection: &str, rev: &str, body: &Document) -> Document {
    let mut doc = Document::new();
    doc.insert(KEY, key);
    doc.insert(ID, format!("{collection}/{key}"));
    doc.insert(REV, rev);
    for (k, v) in body {
        if !is_system(k) {
            doc.insert(k.clone(), v.clone());
        }
    }
    doc
}

/// Merges an UPDATE patch into a stored document.
///
/// With `keep_null == false`, attributes patched to null are removed.
/// With `merge_objects == true`, nested objects are merged recursively
/// instead of replaced.
pub(crate) fn apply_update(
    old: &Document,
    patch: &Document,
    rev: &str,
    keep_null: bool,
    merge_objects: bool,
) -> Document {
    let mut body = old.clone();
    for (k, v) in patch {
        if is_system(k) {
            continue;
        }
        merge_value(&mut body, k, v, keep_null, merge_objects);
    }
    body.insert(REV, rev);
    body
}

fn merge_value(target: &mut Document, name: &str, value: &Bson, keep_null: bool, merge: bool) {
    match value {
        Bson::Null if !keep_null => {
            target.remove(name);
        }
        Bson::Document(patch) if merge => {
            let mut nested = match target.get(name) {
                Some(Bson::Document(existing)) => existing.clone(),
                _ => Document::new(),
            };
            for (k, v) in patch {
                merge_value(&mut nested, k, v, keep_null, merge);
            }
            target.insert(name, nested);
        }
        other => {
            target.insert(name, strip_nulls(other, keep_null));
        }
    }
}

fn strip_nulls(value: &Bson, keep_null: bool) -> Bson {
    match value {
        Bson::Document(doc) if !keep_null => Bson::Document(
            doc.iter()
                .filter(|(_, v)| !matches!(v, Bson::Null))
                .map(|(k, v)| (k.clone(), strip_nulls(v, keep_null)))
                .collect(),
        ),
        other => other.clone(),
    }
}
