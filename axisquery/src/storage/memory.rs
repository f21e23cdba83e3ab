//! In-memory storage backend
//!
//! Holds each table as a single Arrow `RecordBatch` and answers scans by
//! masking, ordering, partitioning and projecting it. Scan calls are counted
//! so callers can observe how often the engine actually reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array};
use arrow::compute::{and, filter_record_batch, lexsort_to_indices, take_record_batch, SortColumn};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use super::{BatchStream, DataFrame, DenseNDArray, ScanRequest, ScanSource, SparseNDArray};
use crate::options::{CoordSelector, ResultOrder};
use crate::{QueryError, Result, SOMA_JOINID};

/// Coordinate record column names of a sparse array
pub const SOMA_DIM_0: &str = "soma_dim_0";
pub const SOMA_DIM_1: &str = "soma_dim_1";
pub const SOMA_DATA: &str = "soma_data";

// ============================================================================
// Shared table core
// ============================================================================

/// A record batch with Int64 index columns, scannable by coordinates and
/// value filter.
pub struct MemoryTable {
    batch: RecordBatch,
    index_columns: Vec<String>,
    scan_count: AtomicUsize,
    last_request: Mutex<Option<ScanRequest>>,
}

impl MemoryTable {
    pub fn new(batch: RecordBatch, index_columns: Vec<String>) -> Result<Self> {
        for name in &index_columns {
            let column = batch
                .column_by_name(name)
                .ok_or_else(|| QueryError::ColumnNotFound(name.clone()))?;
            if column.data_type() != &DataType::Int64 {
                return Err(QueryError::InvalidArgument(format!(
                    "index column '{}' must be Int64, found {}",
                    name,
                    column.data_type()
                )));
            }
        }
        Ok(Self {
            batch,
            index_columns,
            scan_count: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Number of scans issued against this table so far
    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }

    /// The most recent scan request, for inspecting forwarded options
    pub fn last_request(&self) -> Option<ScanRequest> {
        self.last_request.lock().clone()
    }

    fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    fn scan(&self, request: &ScanRequest) -> Result<BatchStream> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        let batches = self.scan_batches(request)?;
        log::trace!(
            "memory scan: {} rows in {} batches",
            batches.iter().map(RecordBatch::num_rows).sum::<usize>(),
            batches.len()
        );
        Ok(Box::new(batches.into_iter().map(Ok)))
    }

    fn scan_batches(&self, request: &ScanRequest) -> Result<Vec<RecordBatch>> {
        if request.coords.len() > self.index_columns.len() {
            return Err(QueryError::InvalidArgument(format!(
                "{} coordinate selectors given for {} index columns",
                request.coords.len(),
                self.index_columns.len()
            )));
        }

        let mut mask: Option<BooleanArray> = None;
        for (selector, name) in request.coords.iter().zip(&self.index_columns) {
            if let Some(selected) = self.coord_mask(name, selector)? {
                mask = Some(match mask {
                    Some(m) => and(&m, &selected)?,
                    None => selected,
                });
            }
        }
        if let Some(filter) = &request.value_filter {
            let selected = filter.select(&self.batch)?;
            mask = Some(match mask {
                Some(m) => and(&m, &selected)?,
                None => selected,
            });
        }

        let selected = match &mask {
            Some(m) => filter_record_batch(&self.batch, m)?,
            None => self.batch.clone(),
        };
        let ordered = self.apply_order(selected, request.result_order)?;
        let partition = match request.partitions {
            Some(p) => {
                let total = ordered.num_rows();
                let chunk = total.div_ceil(p.count());
                let offset = (p.index() * chunk).min(total);
                let len = chunk.min(total - offset);
                ordered.slice(offset, len)
            }
            None => ordered,
        };
        let projected = match &request.column_names {
            Some(columns) => {
                let schema = partition.schema();
                let indices = columns
                    .iter()
                    .map(|name| {
                        schema
                            .index_of(name)
                            .map_err(|_| QueryError::ColumnNotFound(name.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                partition.project(&indices)?
            }
            None => partition,
        };

        let rows = projected.num_rows();
        let batch_rows = request.batch_size.count.unwrap_or(rows).max(1);
        Ok((0..rows)
            .step_by(batch_rows)
            .map(|offset| projected.slice(offset, batch_rows.min(rows - offset)))
            .collect())
    }

    fn index_column(&self, name: &str) -> Result<&Int64Array> {
        self.batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    fn coord_mask(&self, name: &str, selector: &CoordSelector) -> Result<Option<BooleanArray>> {
        let column = self.index_column(name)?;
        let mask = match selector {
            CoordSelector::All => return Ok(None),
            CoordSelector::Ids(ids) => {
                let wanted: AHashSet<i64> = ids.iter().flatten().collect();
                column
                    .iter()
                    .map(|v| Some(v.is_some_and(|v| wanted.contains(&v))))
                    .collect()
            }
            CoordSelector::Range { start, end } => column
                .iter()
                .map(|v| Some(v.is_some_and(|v| v >= *start && v <= *end)))
                .collect(),
        };
        Ok(Some(mask))
    }

    fn apply_order(&self, batch: RecordBatch, order: ResultOrder) -> Result<RecordBatch> {
        let names: Vec<&String> = match order {
            ResultOrder::Auto => return Ok(batch),
            ResultOrder::RowMajor => self.index_columns.iter().collect(),
            ResultOrder::ColumnMajor => self.index_columns.iter().rev().collect(),
        };
        if names.is_empty() || batch.num_rows() < 2 {
            return Ok(batch);
        }
        let sort_columns = names
            .into_iter()
            .map(|name| {
                batch
                    .column_by_name(name)
                    .cloned()
                    .map(|values| SortColumn { values, options: None })
                    .ok_or_else(|| QueryError::ColumnNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let indices = lexsort_to_indices(&sort_columns, None)?;
        Ok(take_record_batch(&batch, &indices)?)
    }
}

// ============================================================================
// DataFrame
// ============================================================================

/// In-memory annotation table, indexed by `soma_joinid` unless told otherwise.
pub struct MemoryDataFrame {
    table: Arc<MemoryTable>,
}

impl MemoryDataFrame {
    pub fn new(batch: RecordBatch) -> Result<Self> {
        Self::with_index_columns(batch, vec![SOMA_JOINID.to_string()])
    }

    pub fn with_index_columns(batch: RecordBatch, index_columns: Vec<String>) -> Result<Self> {
        Ok(Self {
            table: Arc::new(MemoryTable::new(batch, index_columns)?),
        })
    }

    /// Handle to the backing table; stays valid after the frame is moved
    /// into an experiment.
    pub fn table(&self) -> Arc<MemoryTable> {
        self.table.clone()
    }
}

impl ScanSource for MemoryDataFrame {
    fn schema(&self) -> SchemaRef {
        self.table.schema()
    }

    fn index_column_names(&self) -> &[String] {
        &self.table.index_columns
    }

    fn scan(&self, request: &ScanRequest) -> Result<BatchStream> {
        self.table.scan(request)
    }
}

impl DataFrame for MemoryDataFrame {}

// ============================================================================
// Sparse and dense arrays
// ============================================================================

/// In-memory 2-d sparse array of coordinate records.
pub struct MemorySparseArray {
    table: Arc<MemoryTable>,
    shape: Vec<u64>,
}

impl MemorySparseArray {
    /// From a batch with `soma_dim_0`, `soma_dim_1` (Int64) and a numeric
    /// `soma_data` column.
    pub fn new(batch: RecordBatch, shape: [u64; 2]) -> Result<Self> {
        if batch.column_by_name(SOMA_DATA).is_none() {
            return Err(QueryError::ColumnNotFound(SOMA_DATA.to_string()));
        }
        let table = MemoryTable::new(batch, vec![SOMA_DIM_0.to_string(), SOMA_DIM_1.to_string()])?;
        Ok(Self {
            table: Arc::new(table),
            shape: shape.to_vec(),
        })
    }

    /// From `(dim_0, dim_1, value)` triples with Float64 values.
    pub fn from_triples(triples: &[(i64, i64, f64)], shape: [u64; 2]) -> Result<Self> {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_DIM_0, DataType::Int64, false),
            Field::new(SOMA_DIM_1, DataType::Int64, false),
            Field::new(SOMA_DATA, DataType::Float64, false),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(triples.iter().map(|t| t.0))),
            Arc::new(Int64Array::from_iter_values(triples.iter().map(|t| t.1))),
            Arc::new(Float64Array::from_iter_values(triples.iter().map(|t| t.2))),
        ];
        Self::new(RecordBatch::try_new(schema, columns)?, shape)
    }

    pub fn table(&self) -> Arc<MemoryTable> {
        self.table.clone()
    }
}

impl ScanSource for MemorySparseArray {
    fn schema(&self) -> SchemaRef {
        self.table.schema()
    }

    fn index_column_names(&self) -> &[String] {
        &self.table.index_columns
    }

    fn scan(&self, request: &ScanRequest) -> Result<BatchStream> {
        self.table.scan(request)
    }
}

impl SparseNDArray for MemorySparseArray {
    fn shape(&self) -> Vec<u64> {
        self.shape.clone()
    }
}

/// Dense array placeholder; only its shape is visible to the engine.
pub struct MemoryDenseArray {
    shape: Vec<u64>,
}

impl MemoryDenseArray {
    pub fn new(shape: Vec<u64>) -> Self {
        Self { shape }
    }
}

impl DenseNDArray for MemoryDenseArray {
    fn shape(&self) -> Vec<u64> {
        self.shape.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{BatchSize, ReadPartitions};
    use crate::query::Filter;
    use arrow::array::StringArray;

    fn make_frame() -> MemoryDataFrame {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_JOINID, DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![4, 1, 3, 0, 2])),
                Arc::new(StringArray::from(vec!["A", "B", "A", "B", "A"])),
            ],
        )
        .unwrap();
        MemoryDataFrame::new(batch).unwrap()
    }

    fn joinids(batches: BatchStream) -> Vec<i64> {
        batches
            .flat_map(|b| {
                let b = b.unwrap();
                let ids = b
                    .column_by_name(SOMA_JOINID)
                    .unwrap()
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .values()
                    .to_vec();
                ids
            })
            .collect()
    }

    #[test]
    fn test_scan_coords_and_filter() {
        let frame = make_frame();
        let request = ScanRequest::for_coords(vec![CoordSelector::Range { start: 1, end: 4 }])
            .with_value_filter(Filter::eq("label", "A"));
        assert_eq!(joinids(frame.scan(&request).unwrap()), vec![4, 3, 2]);
        assert_eq!(frame.table().scan_count(), 1);
    }

    #[test]
    fn test_scan_order_partition_batches() {
        let frame = make_frame();
        let mut request = ScanRequest::default().with_result_order(ResultOrder::RowMajor);
        request.partitions = Some(ReadPartitions::new(1, 2).unwrap());
        assert_eq!(joinids(frame.scan(&request).unwrap()), vec![3, 4]);

        let mut request = ScanRequest::default();
        request.batch_size = BatchSize::rows(2);
        assert_eq!(frame.scan(&request).unwrap().count(), 3);
    }

    #[test]
    fn test_scan_projection_errors() {
        let frame = make_frame();
        let request = ScanRequest::default().with_columns(Some(vec!["missing".to_string()]));
        assert!(matches!(
            frame.scan(&request),
            Err(QueryError::ColumnNotFound(ref c)) if c == "missing"
        ));

        let request = ScanRequest::for_coords(vec![CoordSelector::All, CoordSelector::All]);
        assert!(matches!(frame.scan(&request), Err(QueryError::InvalidArgument(_))));
    }

    #[test]
    fn test_sparse_array_column_major() {
        let array = MemorySparseArray::from_triples(
            &[(0, 2, 1.0), (1, 0, 2.0), (0, 0, 3.0)],
            [2, 3],
        )
        .unwrap();
        let request = ScanRequest::default().with_result_order(ResultOrder::ColumnMajor);
        let batch = array.scan(&request).unwrap().next().unwrap().unwrap();
        let data = batch
            .column_by_name(SOMA_DATA)
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(data.values().to_vec(), vec![3.0, 2.0, 1.0]);
        assert_eq!(array.shape(), vec![2, 3]);
    }
}
