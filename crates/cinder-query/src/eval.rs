use bson::{Bson, Document};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::QueryError;
use crate::functions;
use crate::value::{self, as_f64, compare, equals, truthy};

/// Variable bindings of one row flowing through a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    vars: Vec<(String, Bson)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name`, replacing an earlier binding of the same name.
    pub fn set(&mut self, name: &str, value: Bson) {
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }

    pub fn with(mut self, name: &str, value: Bson) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Bson> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Executes the subqueries of a statement on behalf of the evaluator.
pub trait Subqueries: Sync {
    /// Runs subquery `id` with the variables of `row` visible and returns
    /// its rows as an array.
    fn run(&self, id: usize, row: &Row) -> Result<Bson, QueryError>;
}

/// Everything an expression can read.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub bind_vars: &'a Document,
    pub row: &'a Row,
    pub subqueries: Option<&'a dyn Subqueries>,
}

impl<'a> Scope<'a> {
    pub fn new(bind_vars: &'a Document, row: &'a Row) -> Self {
        Self {
            bind_vars,
            row,
            subqueries: None,
        }
    }

    pub fn with_subqueries(mut self, subqueries: &'a dyn Subqueries) -> Self {
        self.subqueries = Some(subqueries);
        self
    }
}

impl Expr {
    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Bson, QueryError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Bind(name) => scope
                .bind_vars
                .get(name)
                .cloned()
                .ok_or_else(|| QueryError::BindParameterMissing(name.clone())),
            Expr::Variable(name) => scope
                .row
                .get(name)
                .cloned()
                .ok_or_else(|| QueryError::VariableUnknown(name.clone())),
            Expr::Attribute { base, name } => Ok(attribute(base.evaluate(scope)?, name)),
            Expr::Index { base, index } => {
                let base = base.evaluate(scope)?;
                let index = index.evaluate(scope)?;
                Ok(match (base, index) {
                    (base @ Bson::Document(_), Bson::String(name)) => attribute(base, &name),
                    (Bson::Array(items), idx) => match as_f64(&idx) {
                        Some(i) => {
                            let i = i as i64;
                            let pos = if i < 0 { items.len() as i64 + i } else { i };
                            usize::try_from(pos)
                                .ok()
                                .and_then(|p| items.into_iter().nth(p))
                                .unwrap_or(Bson::Null)
                        }
                        None => Bson::Null,
                    },
                    _ => Bson::Null,
                })
            }
            Expr::Object(fields) => {
                let mut doc = Document::new();
                for (name, e) in fields {
                    doc.insert(name.clone(), e.evaluate(scope)?);
                }
                Ok(Bson::Document(doc))
            }
            Expr::Array(items) => items
                .iter()
                .map(|e| e.evaluate(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Bson::Array),
            Expr::Range(lo, hi) => {
                let lo = value::to_number(&lo.evaluate(scope)?) as i64;
                let hi = value::to_number(&hi.evaluate(scope)?) as i64;
                let items: Vec<Bson> = if lo <= hi {
                    (lo..=hi).map(Bson::Int64).collect()
                } else {
                    (hi..=lo).rev().map(Bson::Int64).collect()
                };
                Ok(Bson::Array(items))
            }
            Expr::Unary(op, e) => {
                let v = e.evaluate(scope)?;
                Ok(match op {
                    UnaryOp::Not => Bson::Boolean(!truthy(&v)),
                    UnaryOp::Neg => value::number(-value::to_number(&v)),
                })
            }
            Expr::Binary(op, l, r) => binary(*op, l, r, scope),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if truthy(&condition.evaluate(scope)?) {
                    then.evaluate(scope)
                } else {
                    otherwise.evaluate(scope)
                }
            }
            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|e| e.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                functions::call(name, values)
            }
            Expr::Subquery { id, .. } => match scope.subqueries {
                Some(subqueries) => subqueries.run(*id, scope.row),
                None => Err(QueryError::Unsupported(
                    "subqueries need a statement to run in".into(),
                )),
            },
        }
    }
}

fn attribute(base: Bson, name: &str) -> Bson {
    match base {
        Bson::Document(mut doc) => doc.remove(name).unwrap_or(Bson::Null),
        _ => Bson::Null,
    }
}

fn binary(op: BinaryOp, l: &Expr, r: &Expr, scope: &Scope<'_>) -> Result<Bson, QueryError> {
    // Short-circuit operators return the deciding operand.
    match op {
        BinaryOp::And => {
            let left = l.evaluate(scope)?;
            return if truthy(&left) { r.evaluate(scope) } else { Ok(left) };
        }
        BinaryOp::Or => {
            let left = l.evaluate(scope)?;
            return if truthy(&left) { Ok(left) } else { r.evaluate(scope) };
        }
        _ => {}
    }

    let left = l.evaluate(scope)?;
    let right = r.evaluate(scope)?;
    let result = match op {
        BinaryOp::Eq => Bson::Boolean(equals(&left, &right)),
        BinaryOp::Ne => Bson::Boolean(!equals(&left, &right)),
        BinaryOp::Lt => Bson::Boolean(compare(&left, &right).is_lt()),
        BinaryOp::Le => Bson::Boolean(compare(&left, &right).is_le()),
        BinaryOp::Gt => Bson::Boolean(compare(&left, &right).is_gt()),
        BinaryOp::Ge => Bson::Boolean(compare(&left, &right).is_ge()),
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match &right {
                Bson::Array(items) => items.iter().any(|item| equals(item, &left)),
                _ => false,
            };
            Bson::Boolean(found == (op == BinaryOp::In))
        }
        BinaryOp::Add => arithmetic(&left, &right, |a, b| Some(a + b)),
        BinaryOp::Sub => arithmetic(&left, &right, |a, b| Some(a - b)),
        BinaryOp::Mul => arithmetic(&left, &right, |a, b| Some(a * b)),
        BinaryOp::Div => arithmetic(&left, &right, |a, b| (b != 0.0).then(|| a / b)),
        BinaryOp::Mod => arithmetic(&left, &right, |a, b| (b != 0.0).then(|| a % b)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };
    Ok(result)
}

/// Arithmetic converts both operands to numbers; division by zero is null.
fn arithmetic(a: &Bson, b: &Bson, f: impl Fn(f64, f64) -> Option<f64>) -> Bson {
    match f(value::to_number(a), value::to_number(b)) {
        Some(n) if n.is_finite() => value::number(n),
        _ => Bson::Null,
    }
}

#[cfg(test)]
mod tests {
    use bson::{bson, doc};

    use super::*;
    use crate::parse;

    fn eval_with(text: &str, row: &Row, bind_vars: &Document) -> Result<Bson, QueryError> {
        let query = parse(text)?;
        query
            .ret
            .expect("query has a RETURN")
            .evaluate(&Scope::new(bind_vars, row))
    }

    fn eval(text: &str) -> Bson {
        eval_with(text, &Row::new(), &Document::new()).unwrap()
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(eval("RETURN 1 + 2 * 3"), Bson::Int64(7));
        assert_eq!(eval("RETURN 7 / 2"), Bson::Double(3.5));
        assert_eq!(eval("RETURN 1 / 0"), Bson::Null);
        assert_eq!(eval("RETURN 3 > 2 && 'a' < 'b'"), Bson::Boolean(true));
        assert_eq!(eval("RETURN 42 == 42.0"), Bson::Boolean(true));
    }

    #[test]
    fn in_operator() {
        assert_eq!(eval("RETURN 2 IN [1, 2, 3]"), Bson::Boolean(true));
        assert_eq!(eval("RETURN 5 NOT IN [1, 2, 3]"), Bson::Boolean(true));
    }

    #[test]
    fn range_expands_inclusively() {
        assert_eq!(eval("RETURN 1..3"), bson!([1i64, 2i64, 3i64]));
        assert_eq!(eval("RETURN 3..1"), bson!([3i64, 2i64, 1i64]));
    }

    #[test]
    fn attribute_access_on_rows() {
        let row = Row::new().with("d", bson!({ "a": { "b": 5 }, "_key": "k1" }));
        let empty = Document::new();
        assert_eq!(
            eval_with("FOR x IN c RETURN 1", &row, &empty).unwrap(),
            Bson::Int64(1)
        );
        let q = parse("FOR d IN c RETURN d.a.b").unwrap();
        assert_eq!(
            q.ret.unwrap().evaluate(&Scope::new(&empty, &row)).unwrap(),
            Bson::Int32(5)
        );
        let q = parse("FOR d IN c RETURN d.missing.x").unwrap();
        assert_eq!(
            q.ret.unwrap().evaluate(&Scope::new(&empty, &row)).unwrap(),
            Bson::Null
        );
    }

    #[test]
    fn bind_parameters() {
        let binds = doc! { "v": "hello" };
        assert_eq!(
            eval_with("RETURN @v", &Row::new(), &binds).unwrap(),
            Bson::String("hello".into())
        );
        assert_eq!(
            eval_with("RETURN @missing", &Row::new(), &binds).unwrap_err(),
            QueryError::BindParameterMissing("missing".into())
        );
    }

    #[test]
    fn object_literal() {
        assert_eq!(
            eval("RETURN { a: 1, 'b c': [true, null] }"),
            bson!({ "a": 1i64, "b c": [true, null] })
        );
    }

    #[test]
    fn ternary_and_logical_values() {
        assert_eq!(eval("RETURN true ? 'x' : 'y'"), Bson::String("x".into()));
        assert_eq!(eval("RETURN null || 'fallback'"), Bson::String("fallback".into()));
        assert_eq!(eval("RETURN 0 && 1"), Bson::Int64(0));
    }

    #[test]
    fn index_access() {
        assert_eq!(eval("RETURN [1, 2, 3][-1]"), Bson::Int64(3));
        assert_eq!(eval("RETURN { a: 1 }['a']"), Bson::Int64(1));
        assert_eq!(eval("RETURN [1][5]"), Bson::Null);
    }

    /// Answers every subquery with its id and the value of `x`.
    struct Echo;

    impl Subqueries for Echo {
        fn run(&self, id: usize, row: &Row) -> Result<Bson, QueryError> {
            Ok(Bson::Array(vec![
                Bson::Int64(id as i64),
                row.get("x").cloned().unwrap_or(Bson::Null),
            ]))
        }
    }

    #[test]
    fn subqueries_run_through_the_scope() {
        let query = parse("FOR x IN [1] RETURN (RETURN x)").unwrap();
        let row = Row::new().with("x", Bson::Int32(7));
        let empty = Document::new();
        let ret = query.ret.unwrap();
        assert!(matches!(
            ret.evaluate(&Scope::new(&empty, &row)),
            Err(QueryError::Unsupported(_))
        ));
        let v = ret
            .evaluate(&Scope::new(&empty, &row).with_subqueries(&Echo))
            .unwrap();
        assert_eq!(v, bson!([0i64, 7]));
    }

    #[test]
    fn ternary_runs_only_the_chosen_subquery() {
        let query = parse("RETURN false ? (RETURN 1) : (RETURN 2)").unwrap();
        let empty = Document::new();
        let row = Row::new();
        let v = query
            .ret
            .unwrap()
            .evaluate(&Scope::new(&empty, &row).with_subqueries(&Echo))
            .unwrap();
        assert_eq!(v, bson!([1i64, null]));
    }

    #[test]
    fn row_set_replaces() {
        let mut row = Row::new().with("a", Bson::Int32(1));
        row.set("a", Bson::Int32(2));
        assert_eq!(row.get("a"), Some(&Bson::Int32(2)));
    }
}
