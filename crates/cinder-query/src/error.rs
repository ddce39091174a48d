/// Errors raised while parsing or evaluating a query.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("syntax error, {message} near line {line}, column {column}")]
    Parse {
        message: String,
        line: usize,
        column: usize,
    },
    #[error("no value specified for declared bind parameter '{0}'")]
    BindParameterMissing(String),
    #[error("unknown variable '{0}'")]
    VariableUnknown(String),
    #[error("variable '{0}' is assigned multiple times")]
    VariableRedeclared(String),
    #[error("usage of unknown function '{0}()'")]
    FunctionUnknown(String),
    #[error("invalid number of arguments for function '{name}()', expected {expected}")]
    FunctionArity { name: String, expected: &'static str },
    #[error("{0}")]
    Unsupported(String),
    /// A subquery failed; its runner keeps the underlying error.
    #[error("subquery failed")]
    SubqueryFailed,
}
