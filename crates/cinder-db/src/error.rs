use cinder_query::QueryError;
use cinder_store::StoreError;

use crate::stats::ExecutionStats;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bson::error::Error),
    #[error("collection or view not found: {0}")]
    CollectionNotFound(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("illegal name: {0}")]
    IllegalName(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("illegal document key: {0}")]
    DocumentKeyBad(String),
    #[error("document key missing")]
    DocumentKeyMissing,
    #[error("invalid document type: {0}")]
    DocumentTypeInvalid(String),
    #[error("unique constraint violated - in index primary of type primary over '_key'; conflicting key: {0}")]
    UniqueConstraintViolated(String),
    #[error("conflict, _rev values do not match")]
    Conflict,
    #[error("must not change the value of a shard key attribute")]
    MustNotChangeShardingAttributes,
    #[error("access after data-modification of collection '{0}'")]
    AccessAfterModification(String),
    #[error("invalid parameter: {0}")]
    BadParameter(String),
    #[error("query killed")]
    QueryKilled,
    #[error("query killed: timeout after {0} s")]
    QueryTimeout(f64),
    #[error("query ID not found: {0}")]
    QueryNotFound(u64),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Numeric error code, compatible with ArangoDB's numbering.
    pub fn error_num(&self) -> u32 {
        match self {
            DbError::Store(_) | DbError::Serialization(_) | DbError::Internal(_) => 4,
            DbError::Query(e) => match e {
                QueryError::Parse { .. } => 1501,
                QueryError::VariableUnknown(_) => 1512,
                QueryError::VariableRedeclared(_) => 1511,
                QueryError::FunctionUnknown(_) => 1540,
                QueryError::FunctionArity { .. } => 1541,
                QueryError::BindParameterMissing(_) => 1551,
                QueryError::Unsupported(_) => 9,
                QueryError::SubqueryFailed => 4,
            },
            DbError::BadParameter(_) => 10,
            DbError::Conflict => 1200,
            DbError::DocumentNotFound(_) => 1202,
            DbError::CollectionNotFound(_) => 1203,
            DbError::DuplicateName(_) => 1207,
            DbError::IllegalName(_) => 1208,
            DbError::UniqueConstraintViolated(_) => 1210,
            DbError::DocumentKeyBad(_) => 1221,
            DbError::DocumentKeyMissing => 1226,
            DbError::DocumentTypeInvalid(_) => 1227,
            DbError::MustNotChangeShardingAttributes => 1469,
            DbError::AccessAfterModification(_) => 1579,
            DbError::QueryKilled | DbError::QueryTimeout(_) => 1500,
            DbError::QueryNotFound(_) => 1591,
        }
    }

    pub fn error_name(&self) -> &'static str {
        match self {
            DbError::Store(_) | DbError::Serialization(_) | DbError::Internal(_) => {
                "ERROR_INTERNAL"
            }
            DbError::Query(e) => match e {
                QueryError::Parse { .. } => "ERROR_QUERY_PARSE",
                QueryError::VariableUnknown(_) => "ERROR_QUERY_VARIABLE_NAME_UNKNOWN",
                QueryError::VariableRedeclared(_) => "ERROR_QUERY_VARIABLE_REDECLARED",
                QueryError::FunctionUnknown(_) => "ERROR_QUERY_FUNCTION_NAME_UNKNOWN",
                QueryError::FunctionArity { .. } => {
                    "ERROR_QUERY_FUNCTION_ARGUMENT_NUMBER_MISMATCH"
                }
                QueryError::BindParameterMissing(_) => "ERROR_QUERY_BIND_PARAMETER_MISSING",
                QueryError::Unsupported(_) => "ERROR_NOT_IMPLEMENTED",
                QueryError::SubqueryFailed => "ERROR_INTERNAL",
            },
            DbError::BadParameter(_) => "ERROR_BAD_PARAMETER",
            DbError::Conflict => "ERROR_ARANGO_CONFLICT",
            DbError::DocumentNotFound(_) => "ERROR_ARANGO_DOCUMENT_NOT_FOUND",
            DbError::CollectionNotFound(_) => "ERROR_ARANGO_DATA_SOURCE_NOT_FOUND",
            DbError::DuplicateName(_) => "ERROR_ARANGO_DUPLICATE_NAME",
            DbError::IllegalName(_) => "ERROR_ARANGO_ILLEGAL_NAME",
            DbError::UniqueConstraintViolated(_) => "ERROR_ARANGO_UNIQUE_CONSTRAINT_VIOLATED",
            DbError::DocumentKeyBad(_) => "ERROR_ARANGO_DOCUMENT_KEY_BAD",
            DbError::DocumentKeyMissing => "ERROR_ARANGO_DOCUMENT_KEY_MISSING",
            DbError::DocumentTypeInvalid(_) => "ERROR_ARANGO_DOCUMENT_TYPE_INVALID",
            DbError::MustNotChangeShardingAttributes => {
                "ERROR_CLUSTER_MUST_NOT_CHANGE_SHARDING_ATTRIBUTES"
            }
            DbError::AccessAfterModification(_) => "ERROR_QUERY_ACCESS_AFTER_MODIFICATION",
            DbError::QueryKilled | DbError::QueryTimeout(_) => "ERROR_QUERY_KILLED",
            DbError::QueryNotFound(_) => "ERROR_QUERY_NOT_FOUND",
        }
    }

    /// Errors scoped to a single document. `ignoreErrors` turns these into
    /// ignored writes; everything else aborts the statement.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            DbError::DocumentNotFound(_)
                | DbError::DocumentKeyBad(_)
                | DbError::DocumentKeyMissing
                | DbError::DocumentTypeInvalid(_)
                | DbError::UniqueConstraintViolated(_)
                | DbError::Conflict
        )
    }
}

/// A failed query together with the writes that were committed before the
/// failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct QueryFailure {
    #[source]
    pub error: DbError,
    pub stats: ExecutionStats,
}

impl QueryFailure {
    pub fn new(error: DbError, stats: ExecutionStats) -> Self {
        Self { error, stats }
    }
}

impl From<DbError> for QueryFailure {
    fn from(error: DbError) -> Self {
        Self {
            error,
            stats: ExecutionStats::default(),
        }
    }
}
