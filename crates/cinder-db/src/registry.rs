use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::error::DbError;
use crate::session::CancellationToken;

/// A query currently executing, as reported by
/// [`Database::running_queries`](crate::Database::running_queries).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningQuery {
    pub id: u64,
    pub query: String,
    /// Seconds since the query started.
    pub run_time: f64,
}

struct Entry {
    query: String,
    started: Instant,
    token: CancellationToken,
}

#[derive(Default)]
pub(crate) struct QueryRegistry {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, Entry>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, query: &str, token: CancellationToken) -> Registration<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            Entry {
                query: query.to_string(),
                started: Instant::now(),
                token,
            },
        );
        Registration { registry: self, id }
    }

    pub fn list(&self) -> Vec<RunningQuery> {
        let mut out: Vec<RunningQuery> = self
            .lock()
            .iter()
            .map(|(id, e)| RunningQuery {
                id: *id,
                query: e.query.clone(),
                run_time: e.started.elapsed().as_secs_f64(),
            })
            .collect();
        out.sort_by_key(|q| q.id);
        out
    }

    pub fn kill(&self, id: u64) -> Result<(), DbError> {
        match self.lock().get(&id) {
            Some(entry) => {
                tracing::info!(id, query = %entry.query, "killing query");
                entry.token.kill();
                Ok(())
            }
            None => Err(DbError::QueryNotFound(id)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the query from the registry when dropped.
pub(crate) struct Registration<'a> {
    registry: &'a QueryRegistry,
    id: u64,
}

impl Registration<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_list_deregister() {
        let reg = QueryRegistry::new();
        let token = CancellationToken::new(None).unwrap();
        {
            let r = reg.register("FOR d IN c RETURN d", token);
            let running = reg.list();
            assert_eq!(running.len(), 1);
            assert_eq!(running[0].id, r.id());
            assert_eq!(running[0].query, "FOR d IN c RETURN d");
        }
        assert!(reg.list().is_empty());
    }

    #[test]
    fn kill_sets_token() {
        let reg = QueryRegistry::new();
        let token = CancellationToken::new(None).unwrap();
        let r = reg.register("q", token.clone());
        reg.kill(r.id()).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn kill_unknown_query() {
        let reg = QueryRegistry::new();
        assert!(matches!(reg.kill(42), Err(DbError::QueryNotFound(42))));
    }
}
