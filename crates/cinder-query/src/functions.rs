use bson::{Bson, Document};

use crate::error::QueryError;
use crate::value;

/// Invokes a built-in function. `name` is upper-cased by the parser.
pub(crate) fn call(name: &str, args: Vec<Bson>) -> Result<Bson, QueryError> {
    match name {
        "CONCAT" => Ok(Bson::String(args.iter().map(value::to_text).collect())),
        // Evaluates like the identity; only planning treats it differently.
        "NOOPT" => one(name, args),
        "TO_STRING" => one(name, args).map(|v| Bson::String(value::to_text(&v))),
        "TO_NUMBER" => one(name, args).map(|v| value::number(value::to_number(&v))),
        "LENGTH" => {
            let v = one(name, args)?;
            let len = match &v {
                Bson::Null | Bson::Undefined => 0,
                Bson::Boolean(b) => usize::from(*b),
                Bson::String(s) => s.chars().count(),
                Bson::Array(items) => items.len(),
                Bson::Document(doc) => doc.len(),
                other => value::to_text(other).chars().count(),
            };
            Ok(Bson::Int64(len as i64))
        }
        "MERGE" => {
            if args.is_empty() {
                return Err(arity(name, "at least 1"));
            }
            let mut merged = Document::new();
            for arg in args {
                match arg {
                    Bson::Document(doc) => {
                        for (k, v) in doc {
                            merged.insert(k, v);
                        }
                    }
                    Bson::Null => {}
                    _ => return Ok(Bson::Null),
                }
            }
            Ok(Bson::Document(merged))
        }
        "HAS" => {
            let [doc, attr]: [Bson; 2] = args.try_into().map_err(|_| arity(name, "2"))?;
            Ok(Bson::Boolean(match (doc, attr) {
                (Bson::Document(doc), Bson::String(attr)) => doc.contains_key(&attr),
                _ => false,
            }))
        }
        _ => Err(QueryError::FunctionUnknown(name.to_string())),
    }
}

fn one(name: &str, args: Vec<Bson>) -> Result<Bson, QueryError> {
    let [v]: [Bson; 1] = args.try_into().map_err(|_| arity(name, "1"))?;
    Ok(v)
}

fn arity(name: &str, expected: &'static str) -> QueryError {
    QueryError::FunctionArity {
        name: name.to_string(),
        expected,
    }
}
