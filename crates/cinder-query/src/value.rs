//! Value helpers shared by the evaluator and the planner.
//!
//! Values are plain [`Bson`]. Ordering follows the query language's type
//! order: null < boolean < number < string < array < object. Numbers
//! compare by value regardless of their BSON width.

use std::cmp::Ordering;

use bson::{Bson, Document};

fn type_rank(v: &Bson) -> u8 {
    match v {
        Bson::Null | Bson::Undefined => 0,
        Bson::Boolean(_) => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 2,
        Bson::String(_) => 3,
        Bson::Array(_) => 4,
        Bson::Document(_) => 5,
        _ => 6,
    }
}

/// Numeric view of a BSON number.
pub fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Total order over values.
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn compare_documents(x: &Document, y: &Document) -> Ordering {
    let mut keys: Vec<&String> = x.keys().chain(y.keys()).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        let l = x.get(key).unwrap_or(&Bson::Null);
        let r = y.get(key).unwrap_or(&Bson::Null);
        let ord = compare(l, r);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn equals(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Ordering::Equal
}

pub fn truthy(v: &Bson) -> bool {
    match v {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::String(s) => !s.is_empty(),
        other => match as_f64(other) {
            Some(n) => n != 0.0,
            None => true,
        },
    }
}

/// Looks up a dotted attribute path. Returns `None` if any segment is
/// missing or a non-object is traversed.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

pub fn to_number(v: &Bson) -> f64 {
    match v {
        Bson::Boolean(true) => 1.0,
        Bson::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                0.0
            } else {
                t.parse().unwrap_or(0.0)
            }
        }
        Bson::Array(items) => match items.as_slice() {
            [] => 0.0,
            [single] => to_number(single),
            _ => 0.0,
        },
        other => as_f64(other).unwrap_or(0.0),
    }
}

/// String conversion used by `CONCAT` and `TO_STRING`.
pub fn to_text(v: &Bson) -> String {
    match v {
        Bson::Null | Bson::Undefined => String::new(),
        Bson::Boolean(b) => b.to_string(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => format_double(*n),
        Bson::Array(items) => {
            let parts: Vec<String> = items.iter().map(to_json_text).collect();
            format!("[{}]", parts.join(","))
        }
        Bson::Document(_) => to_json_text(v),
        other => other.to_string(),
    }
}

fn format_double(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn to_json_text(v: &Bson) -> String {
    match v {
        Bson::Null | Bson::Undefined => "null".to_string(),
        Bson::String(s) => format!("{s:?}"),
        Bson::Document(d) => {
            let parts: Vec<String> = d
                .iter()
                .map(|(k, v)| format!("{k:?}:{}", to_json_text(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        other => to_text(other),
    }
}

/// Builds a number, preferring an integer when the value is integral.
pub fn number(n: f64) -> Bson {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Bson::Int64(n as i64)
    } else {
        Bson::Double(n)
    }
}
