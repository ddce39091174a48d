//! Sharded collections with a query planner that decides, per data
//! modification, which shards a row has to visit.

mod catalog;
mod config;
mod cursor;
mod database;
mod document;
mod error;
mod executor;
mod explain;
mod planner;
mod registry;
mod session;
mod stats;

pub use bson::{Bson, Document};
pub use cinder_store::MemoryStore;
pub use catalog::{CollectionHandle, ShardId, ShardMap};
pub use config::{
    CollectionOptions, DatabaseConfig, ModificationOptions, OptimizerOptions, QueryOptions,
};
pub use cursor::{Cursor, Extra};
pub use database::Database;
pub use error::{DbError, QueryFailure};
pub use explain::{ExecutionNode, Explain, NodeType};
pub use registry::RunningQuery;
pub use session::CancellationToken;
pub use stats::ExecutionStats;

/// Names of the optimizer rules that `optimizer.rules` can toggle.
pub mod rules {
    pub use crate::planner::rules::{
        DISTRIBUTE_IN_CLUSTER, OPTIMIZE_SINGLE_DOCUMENT_OPERATIONS, RESTRICT_TO_SINGLE_SHARD,
        SCATTER_IN_CLUSTER, UNDISTRIBUTE_REMOVE_AFTER_ENUM_COLL, USE_INDEXES,
    };
}
