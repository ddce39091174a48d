use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bson::{Bson, Document};
use cinder_query::CollectionRef;

use crate::catalog::{CollectionHandle, KeyGenerator, Snapshot};
use crate::config::{DatabaseConfig, QueryOptions};
use crate::error::DbError;
use crate::planner::RuleSet;

/// Shared kill switch of one query.
///
/// Tripped explicitly through [`CancellationToken::kill`] or implicitly
/// once the optional deadline passes.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    killed: AtomicBool,
    deadline: Option<Instant>,
    max_runtime: f64,
}

impl CancellationToken {
    /// A runtime of zero or less means no deadline. Runtimes too large to
    /// express as a deadline are rejected.
    pub fn new(max_runtime: Option<f64>) -> Result<Self, DbError> {
        let max_runtime = max_runtime.filter(|s| s.is_finite() && *s > 0.0);
        let deadline = match max_runtime {
            None => None,
            Some(secs) => {
                let too_large =
                    || DbError::BadParameter(format!("maxRuntime {secs} is out of range"));
                let runtime = Duration::try_from_secs_f64(secs).map_err(|_| too_large())?;
                Some(Instant::now().checked_add(runtime).ok_or_else(too_large)?)
            }
        };
        Ok(Self {
            inner: Arc::new(TokenInner {
                killed: AtomicBool::new(false),
                deadline,
                max_runtime: max_runtime.unwrap_or(0.0),
            }),
        })
    }

    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    pub fn check(&self) -> Result<(), DbError> {
        if self.inner.killed.load(Ordering::Acquire) {
            return Err(DbError::QueryKilled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(DbError::QueryTimeout(self.inner.max_runtime))
            }
            _ => Ok(()),
        }
    }
}

/// Everything planning and execution of one statement needs.
pub(crate) struct Session<'a, S> {
    pub catalog: Snapshot<S>,
    pub bind_vars: &'a Document,
    pub options: &'a QueryOptions,
    pub config: &'a DatabaseConfig,
    pub rules: RuleSet,
    pub token: CancellationToken,
    pub keys: &'a KeyGenerator,
}

impl<S: cinder_store::Store> Session<'_, S> {
    pub fn collection(&self, coll: &CollectionRef) -> Result<CollectionHandle<S>, DbError> {
        let name = match coll {
            CollectionRef::Name(name) => name.clone(),
            CollectionRef::Bind(param) => {
                let bind = format!("@{param}");
                match self.bind_vars.get(&bind) {
                    Some(Bson::String(name)) => name.clone(),
                    Some(other) => {
                        return Err(DbError::BadParameter(format!(
                            "collection bind parameter '{bind}' must be a string, got {other}"
                        )));
                    }
                    None => {
                        return Err(cinder_query::QueryError::BindParameterMissing(bind).into());
                    }
                }
            }
        };
        self.catalog
            .get(&name)
            .cloned()
            .ok_or(DbError::CollectionNotFound(name))
    }

    pub fn intermediate_commit_count(&self) -> Option<u64> {
        self.options
            .intermediate_commit_count
            .or(self.config.intermediate_commit_count)
            .filter(|n| *n > 0)
    }

    pub fn channel_capacity(&self) -> usize {
        self.config.channel_capacity.max(1)
    }
}
