//! Query and read option types
//!
//! Plain immutable value objects; the only behaviour is builder-style
//! construction.

use std::collections::HashMap;

use arrow::array::Int64Array;
use serde::{Deserialize, Serialize};

use crate::axis::{Axis, AxisPair};
use crate::query::Filter;

/// Opaque storage-engine configuration, forwarded untouched to scans.
pub type PlatformConfig = HashMap<String, serde_json::Value>;

/// Per-axis column projection for axis table reads. `None` reads all columns.
pub type AxisColumnNames = AxisPair<Option<Vec<String>>>;

// ============================================================================
// Coordinates and axis queries
// ============================================================================

/// Coordinate selection on one index column / dimension.
#[derive(Debug, Clone, Default)]
pub enum CoordSelector {
    /// No restriction
    #[default]
    All,
    /// Explicit set of coordinates
    Ids(Int64Array),
    /// Inclusive range
    Range { start: i64, end: i64 },
}

impl CoordSelector {
    pub fn ids(ids: impl Into<Vec<i64>>) -> Self {
        CoordSelector::Ids(Int64Array::from(ids.into()))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, CoordSelector::All)
    }
}

/// Filter for one axis: explicit coordinates and/or a value filter.
#[derive(Debug, Clone, Default)]
pub struct AxisQuery {
    /// One selector per index column; missing trailing selectors mean `All`
    pub coords: Vec<CoordSelector>,
    pub value_filter: Option<Filter>,
}

impl AxisQuery {
    /// Query selecting everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_coords(mut self, coords: Vec<CoordSelector>) -> Self {
        self.coords = coords;
        self
    }

    pub fn with_value_filter(mut self, filter: Filter) -> Self {
        self.value_filter = Some(filter);
        self
    }

    /// Parse and attach a textual value filter such as `"label == 'A'"`.
    pub fn with_filter_str(self, filter: &str) -> crate::Result<Self> {
        Ok(self.with_value_filter(Filter::parse(filter)?))
    }

    /// True when neither coordinates nor a value filter restrict the axis.
    pub fn selects_all(&self) -> bool {
        self.value_filter.is_none() && self.coords.iter().all(CoordSelector::is_all)
    }
}

// ============================================================================
// Scan options
// ============================================================================

/// Batch sizing hint for scans
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSize {
    /// Maximum rows per returned batch; `None` lets the storage engine decide
    pub count: Option<usize>,
}

impl BatchSize {
    pub fn rows(count: usize) -> Self {
        Self { count: Some(count) }
    }
}

/// Selects one partition of a partitioned (parallel/distributed) read.
///
/// Always satisfies `index < count`; deserialization goes through
/// [`ReadPartitions::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PartitionSpec")]
pub struct ReadPartitions {
    index: usize,
    count: usize,
}

#[derive(Deserialize)]
struct PartitionSpec {
    index: usize,
    count: usize,
}

impl ReadPartitions {
    pub fn new(index: usize, count: usize) -> crate::Result<Self> {
        if count == 0 || index >= count {
            return Err(crate::QueryError::InvalidArgument(format!(
                "partition {} out of range for {} partitions",
                index, count
            )));
        }
        Ok(Self { index, count })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl TryFrom<PartitionSpec> for ReadPartitions {
    type Error = crate::QueryError;

    fn try_from(spec: PartitionSpec) -> crate::Result<Self> {
        Self::new(spec.index, spec.count)
    }
}

/// Result ordering hint forwarded to the storage engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultOrder {
    /// Whatever order the storage engine finds cheapest
    #[default]
    Auto,
    RowMajor,
    ColumnMajor,
}

/// Options for lazy axis-table and sparse-layer reads.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub column_names: Option<Vec<String>>,
    pub batch_size: BatchSize,
    pub partitions: Option<ReadPartitions>,
    pub result_order: ResultOrder,
    pub platform_config: Option<PlatformConfig>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.column_names = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_partitions(mut self, partitions: ReadPartitions) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_result_order(mut self, order: ResultOrder) -> Self {
        self.result_order = order;
        self
    }

    pub fn with_platform_config(mut self, config: PlatformConfig) -> Self {
        self.platform_config = Some(config);
        self
    }
}

// ============================================================================
// Materializing read options
// ============================================================================

/// Options for [`crate::ExperimentAxisQuery::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Axis table column projections
    pub column_names: AxisColumnNames,
    /// Additional X layers returned in `x_layers`
    pub x_layers: Vec<String>,
    /// `obsm` / `varm` layers, densified
    pub m_layers: AxisPair<Vec<String>>,
    /// `obsp` / `varp` layers, densified
    pub p_layers: AxisPair<Vec<String>>,
    /// Drop unused dictionary categories on both axis tables
    pub drop_levels: bool,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<S: Into<String>>(
        mut self,
        axis: Axis,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        *axis.get_mut_from(&mut self.column_names) =
            Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_x_layers<S: Into<String>>(mut self, layers: impl IntoIterator<Item = S>) -> Self {
        self.x_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_m_layers<S: Into<String>>(
        mut self,
        axis: Axis,
        layers: impl IntoIterator<Item = S>,
    ) -> Self {
        *axis.get_mut_from(&mut self.m_layers) = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_p_layers<S: Into<String>>(
        mut self,
        axis: Axis,
        layers: impl IntoIterator<Item = S>,
    ) -> Self {
        *axis.get_mut_from(&mut self.p_layers) = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn drop_levels(mut self, drop: bool) -> Self {
        self.drop_levels = drop;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_query_selects_all() {
        assert!(AxisQuery::all().selects_all());
        assert!(AxisQuery::all()
            .with_coords(vec![CoordSelector::All])
            .selects_all());
        assert!(!AxisQuery::all()
            .with_coords(vec![CoordSelector::ids(vec![1, 2])])
            .selects_all());
        assert!(!AxisQuery::all().with_value_filter(Filter::True).selects_all());
    }

    #[test]
    fn test_read_partitions_validation() {
        assert!(ReadPartitions::new(0, 2).is_ok());
        assert!(ReadPartitions::new(2, 2).is_err());
        assert!(ReadPartitions::new(0, 0).is_err());

        let parsed: ReadPartitions = serde_json::from_str(r#"{"index": 1, "count": 3}"#).unwrap();
        assert_eq!((parsed.index(), parsed.count()), (1, 3));
        assert!(serde_json::from_str::<ReadPartitions>(r#"{"index": 0, "count": 0}"#).is_err());
        assert!(serde_json::from_str::<ReadPartitions>(r#"{"index": 2, "count": 2}"#).is_err());
    }

    #[test]
    fn test_result_order_serde() {
        let order: ResultOrder = serde_json::from_str("\"column-major\"").unwrap();
        assert_eq!(order, ResultOrder::ColumnMajor);
    }

    #[test]
    fn test_read_options_builder() {
        let opts = ReadOptions::new()
            .with_columns(Axis::Obs, ["label"])
            .with_m_layers(Axis::Var, ["pcs"])
            .drop_levels(true);
        assert_eq!(opts.column_names.obs, Some(vec!["label".to_string()]));
        assert_eq!(opts.column_names.var, None);
        assert_eq!(opts.m_layers.var, vec!["pcs".to_string()]);
        assert!(opts.drop_levels);
    }
}
