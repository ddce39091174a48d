pub mod ast;
mod error;
mod eval;
mod functions;
mod lexer;
mod parser;
pub mod value;

pub use ast::{
    BinaryOp, Clause, CollectionRef, Expr, ForClause, ForSource, LimitClause, Modification,
    ModificationKind, Query, UnaryOp,
};
pub use error::QueryError;
pub use eval::{Row, Scope, Subqueries};
pub use parser::parse;
