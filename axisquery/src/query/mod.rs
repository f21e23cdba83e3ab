//! Axis query engine
//!
//! Join-id resolution and caching, join-id → position indexing, sparse
//! assembly and the per-measurement query orchestrator.

pub mod csr;
mod experiment_query;
mod filter;
pub mod indexer;
mod joinids;
mod result;

pub use csr::{CsrMatrix, DenseMatrix};
pub use experiment_query::ExperimentAxisQuery;
pub use filter::{CompareOp, Filter, Value};
pub use indexer::{
    hash_index_factory, sorted_index_factory, AxisIndexer, HashJoinIdIndex, IndexFactory,
    IndexLike, PositionalIndex, SortedJoinIdIndex, NOT_FOUND,
};
pub use joinids::JoinIdCache;
pub use result::{drop_unused_categories, AxisQueryResult};
