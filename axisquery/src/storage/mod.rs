//! Storage interface
//!
//! The query engine never evaluates predicates or touches an on-disk format
//! itself. It talks to the storage engine through [`ScanSource::scan`] and
//! resolves named members through [`Collection`], [`Measurement`] and
//! [`Experiment`].
//!
//! [`memory`] provides an Arrow-backed implementation of these traits.

pub mod memory;
mod read_iter;

pub use memory::{MemoryDataFrame, MemoryDenseArray, MemorySparseArray, MemoryTable};
pub use read_iter::{ReadIter, SparseRead};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::context::SomaContext;
use crate::options::{AxisQuery, BatchSize, CoordSelector, PlatformConfig, ReadPartitions, ResultOrder, ScanOptions};
use crate::query::{ExperimentAxisQuery, Filter};
use crate::Result;

/// Lazy sequence of table batches produced by one scan.
pub type BatchStream = Box<dyn Iterator<Item = Result<RecordBatch>> + Send>;

// ============================================================================
// Scan contract
// ============================================================================

/// Everything a storage scan needs: coordinates, predicate, projection and
/// the read hints forwarded from the caller.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// One selector per index column / dimension
    pub coords: Vec<CoordSelector>,
    pub value_filter: Option<Filter>,
    /// `None` projects every column
    pub column_names: Option<Vec<String>>,
    pub batch_size: BatchSize,
    pub partitions: Option<ReadPartitions>,
    pub result_order: ResultOrder,
    pub platform_config: Option<PlatformConfig>,
}

impl ScanRequest {
    /// Request restricted by an axis query.
    pub fn for_axis(query: &AxisQuery) -> Self {
        Self {
            coords: query.coords.clone(),
            value_filter: query.value_filter.clone(),
            ..Self::default()
        }
    }

    /// Request restricted to explicit coordinates only.
    pub fn for_coords(coords: Vec<CoordSelector>) -> Self {
        Self {
            coords,
            ..Self::default()
        }
    }

    pub fn with_columns(mut self, columns: Option<Vec<String>>) -> Self {
        self.column_names = columns;
        self
    }

    pub fn with_value_filter(mut self, filter: Filter) -> Self {
        self.value_filter = Some(filter);
        self
    }

    pub fn with_result_order(mut self, order: ResultOrder) -> Self {
        self.result_order = order;
        self
    }

    /// Apply caller read options; an explicit projection in `options` wins.
    pub fn with_options(mut self, options: &ScanOptions) -> Self {
        if options.column_names.is_some() {
            self.column_names = options.column_names.clone();
        }
        self.batch_size = options.batch_size;
        self.partitions = options.partitions;
        self.result_order = options.result_order;
        self.platform_config = options.platform_config.clone();
        self
    }
}

/// Anything that can be scanned into Arrow batches.
pub trait ScanSource: Send + Sync {
    /// Full, unprojected schema
    fn schema(&self) -> SchemaRef;

    /// Columns that coordinate selectors apply to, in selector order
    fn index_column_names(&self) -> &[String];

    /// Start a scan. Errors are returned to the caller unchanged.
    fn scan(&self, request: &ScanRequest) -> Result<BatchStream>;
}

/// An annotation table (`obs`, `var`, spatial presence)
pub trait DataFrame: ScanSource {}

/// A sparse N-d array stored as coordinate records
/// (`soma_dim_0`, `soma_dim_1`, `soma_data`).
pub trait SparseNDArray: ScanSource {
    /// Declared extent of each dimension
    fn shape(&self) -> Vec<u64>;
}

/// A dense N-d array. The query engine only inspects its shape.
pub trait DenseNDArray: Send + Sync {
    fn shape(&self) -> Vec<u64>;
}

// ============================================================================
// Layers and collections
// ============================================================================

/// Physical kind of a matrix layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Sparse,
    Dense,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Sparse => f.write_str("sparse"),
            LayerKind::Dense => f.write_str("dense"),
        }
    }
}

/// A named matrix layer inside a collection
#[derive(Clone)]
pub enum Layer {
    Sparse(Arc<dyn SparseNDArray>),
    Dense(Arc<dyn DenseNDArray>),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Sparse(_) => LayerKind::Sparse,
            Layer::Dense(_) => LayerKind::Dense,
        }
    }

    pub fn shape(&self) -> Vec<u64> {
        match self {
            Layer::Sparse(array) => array.shape(),
            Layer::Dense(array) => array.shape(),
        }
    }

    pub fn as_sparse(&self) -> Option<&Arc<dyn SparseNDArray>> {
        match self {
            Layer::Sparse(array) => Some(array),
            Layer::Dense(_) => None,
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("kind", &self.kind())
            .field("shape", &self.shape())
            .finish()
    }
}

/// Named members with presence checks
#[derive(Debug, Clone)]
pub struct Collection<T> {
    name: String,
    members: BTreeMap<String, T>,
}

impl<T> Collection<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeMap::new(),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, member: T) -> Self {
        self.insert(key, member);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, member: T) -> Option<T> {
        self.members.insert(key.into(), member)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.members.get(key)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Collection<Layer> {
    /// Add a sparse layer
    pub fn with_sparse(self, key: impl Into<String>, array: impl SparseNDArray + 'static) -> Self {
        self.with(key, Layer::Sparse(Arc::new(array)))
    }

    /// Add a dense layer
    pub fn with_dense(self, key: impl Into<String>, array: impl DenseNDArray + 'static) -> Self {
        self.with(key, Layer::Dense(Arc::new(array)))
    }
}

// ============================================================================
// Measurement and experiment
// ============================================================================

/// Per-axis auxiliary matrix collections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisMatrices {
    /// `obsm` / `varm`: axis × components
    Multi,
    /// `obsp` / `varp`: axis × same axis
    Pairwise,
}

impl AxisMatrices {
    pub const fn suffix(self) -> &'static str {
        match self {
            AxisMatrices::Multi => "m",
            AxisMatrices::Pairwise => "p",
        }
    }

    /// Collection name for an axis, e.g. `"obsp"`.
    pub fn collection_name(self, axis: Axis) -> String {
        axis.key("", self.suffix())
    }
}

/// One measurement: a `var` table, the `X` layers and optional auxiliary
/// matrix collections.
pub struct Measurement {
    pub var: Arc<dyn DataFrame>,
    pub x: Collection<Layer>,
    /// Keyed by composed collection name (`"obsm"`, `"varp"`, ...)
    axis_matrices: BTreeMap<String, Collection<Layer>>,
    pub var_spatial_presence: Option<Arc<dyn DataFrame>>,
}

impl Measurement {
    pub fn new(var: impl DataFrame + 'static, x: Collection<Layer>) -> Self {
        Self {
            var: Arc::new(var),
            x,
            axis_matrices: BTreeMap::new(),
            var_spatial_presence: None,
        }
    }

    pub fn with_axis_matrices(
        mut self,
        axis: Axis,
        kind: AxisMatrices,
        collection: Collection<Layer>,
    ) -> Self {
        self.axis_matrices.insert(kind.collection_name(axis), collection);
        self
    }

    pub fn with_var_spatial_presence(mut self, frame: impl DataFrame + 'static) -> Self {
        self.var_spatial_presence = Some(Arc::new(frame));
        self
    }

    /// The `obsm`/`obsp`/`varm`/`varp` collection, if this measurement has it.
    pub fn axis_matrices(&self, axis: Axis, kind: AxisMatrices) -> Option<&Collection<Layer>> {
        axis.getitem_from(&self.axis_matrices, "", kind.suffix())
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Measurement")
            .field("x", &self.x)
            .field("axis_matrices", &self.axis_matrices.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An experiment: the `obs` table plus named measurements, bound to a
/// session context.
pub struct Experiment {
    pub obs: Arc<dyn DataFrame>,
    pub ms: Collection<Arc<Measurement>>,
    pub obs_spatial_presence: Option<Arc<dyn DataFrame>>,
    context: Arc<SomaContext>,
}

impl Experiment {
    pub fn new(obs: impl DataFrame + 'static, context: Arc<SomaContext>) -> Self {
        Self {
            obs: Arc::new(obs),
            ms: Collection::new("ms"),
            obs_spatial_presence: None,
            context,
        }
    }

    pub fn with_measurement(mut self, name: impl Into<String>, measurement: Measurement) -> Self {
        self.ms.insert(name, Arc::new(measurement));
        self
    }

    pub fn with_obs_spatial_presence(mut self, frame: impl DataFrame + 'static) -> Self {
        self.obs_spatial_presence = Some(Arc::new(frame));
        self
    }

    pub fn context(&self) -> &Arc<SomaContext> {
        &self.context
    }

    /// Open an axis query against one measurement.
    pub fn axis_query(
        &self,
        measurement_name: &str,
        obs_query: Option<AxisQuery>,
        var_query: Option<AxisQuery>,
    ) -> Result<ExperimentAxisQuery> {
        ExperimentAxisQuery::new(self, measurement_name, obs_query, var_query)
    }
}
