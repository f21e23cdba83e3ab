//! AxisQuery Core Engine
//!
//! Axis-filtered, joined access to sparse annotated-matrix experiments.
//!
//! An experiment pairs an `obs` (row-axis) annotation table with one or more
//! measurements, each carrying a `var` (column-axis) annotation table and a set
//! of sparse matrix layers addressed by `(soma_joinid, soma_joinid)`. The
//! [`ExperimentAxisQuery`] resolves per-axis filters into ordered join-id sets,
//! builds join-id → ordinal indexes from them, and slices matrix layers down to
//! the exact selected sub-rectangle.

pub mod axis;
pub mod context;
pub mod options;
pub mod query;
pub mod storage;

pub use axis::{Axis, AxisPair, HasObsVar};
pub use context::{ContextConfig, SomaContext};
pub use options::{
    AxisColumnNames, AxisQuery, BatchSize, CoordSelector, PlatformConfig, ReadOptions,
    ReadPartitions, ResultOrder, ScanOptions,
};
pub use query::{
    AxisIndexer, AxisQueryResult, CompareOp, CsrMatrix, DenseMatrix, ExperimentAxisQuery,
    Filter, IndexFactory, IndexLike, JoinIdCache, NOT_FOUND,
};
pub use storage::{
    AxisMatrices, Collection, DataFrame, DenseNDArray, Experiment, Layer, LayerKind,
    Measurement, ReadIter, ScanRequest, ScanSource, SparseNDArray, SparseRead,
};

use arrow::error::ArrowError;

/// Name of the join identifier column on both axis annotation tables.
pub const SOMA_JOINID: &str = "soma_joinid";

/// Query engine error type
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Measurement not found: {0}")]
    MeasurementNotFound(String),

    #[error("Layer '{layer}' is not present in {collection}")]
    LayerNotFound { collection: String, layer: String },

    #[error("Measurement does not contain {0} data")]
    CollectionNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Layer '{layer}' in {collection} is a {actual} array, expected {expected}")]
    WrongKind {
        collection: String,
        layer: String,
        expected: LayerKind,
        actual: LayerKind,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Filter parse error: {0}")]
    FilterParse(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("Task did not complete: {0}")]
    Task(String),
}

impl QueryError {
    /// True for every "requested name does not exist" failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueryError::MeasurementNotFound(_)
                | QueryError::LayerNotFound { .. }
                | QueryError::CollectionNotFound(_)
                | QueryError::ColumnNotFound(_)
        )
    }

    /// True when a named layer exists but has the wrong physical kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, QueryError::WrongKind { .. })
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
