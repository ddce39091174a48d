use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bson::Bson;
use cinder_query::{QueryError, Row, Scope, Subqueries};
use cinder_store::Store;

use super::QueryOutput;
use crate::error::{DbError, QueryFailure};
use crate::planner::plan::Pipeline;
use crate::session::Session;
use crate::stats::ExecutionStats;

/// Executes one statement and the subqueries its expressions call.
///
/// Subqueries run to completion, commits included, every time an
/// expression asks for them. Their statistics and the first error they
/// raise are kept here until the statement finishes.
pub(crate) struct Statement<'a, 's, S> {
    pub session: &'a Session<'s, S>,
    subqueries: &'a BTreeMap<usize, Pipeline<S>>,
    stats: Mutex<ExecutionStats>,
    error: Mutex<Option<DbError>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'a, 's, S: Store + Send + Sync> Statement<'a, 's, S> {
    pub fn new(session: &'a Session<'s, S>, subqueries: &'a BTreeMap<usize, Pipeline<S>>) -> Self {
        Self {
            session,
            subqueries,
            stats: Mutex::new(ExecutionStats::default()),
            error: Mutex::new(None),
        }
    }

    /// The scope expressions of this statement evaluate in.
    pub fn scope<'r>(&'r self, row: &'r Row) -> Scope<'r> {
        Scope::new(self.session.bind_vars, row).with_subqueries(self)
    }

    /// Folds subquery statistics into the result and replaces a failed
    /// subquery with the error it raised.
    pub fn finish(
        self,
        result: Result<QueryOutput, QueryFailure>,
    ) -> Result<QueryOutput, QueryFailure> {
        let stats = self.stats.into_inner().unwrap_or_else(PoisonError::into_inner);
        let error = self.error.into_inner().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(mut out) => {
                out.stats += stats;
                Ok(out)
            }
            Err(mut failure) => {
                failure.stats += stats;
                if matches!(failure.error, DbError::Query(QueryError::SubqueryFailed))
                    && let Some(e) = error
                {
                    failure.error = e;
                }
                Err(failure)
            }
        }
    }
}

impl<S: Store + Send + Sync> Subqueries for Statement<'_, '_, S> {
    fn run(&self, id: usize, row: &Row) -> Result<Bson, QueryError> {
        let result = match self.subqueries.get(&id) {
            Some(pipeline) => super::run(pipeline, self, row),
            None => Err(DbError::Internal(format!("subquery {id} was not planned")).into()),
        };
        match result {
            Ok(QueryOutput { rows, stats }) => {
                *lock(&self.stats) += stats;
                Ok(Bson::Array(rows))
            }
            Err(failure) => {
                tracing::debug!(subquery = id, error = %failure.error, "subquery failed");
                *lock(&self.stats) += failure.stats;
                let mut first = lock(&self.error);
                if first.is_none() {
                    *first = Some(failure.error);
                }
                Err(QueryError::SubqueryFailed)
            }
        }
    }
}
