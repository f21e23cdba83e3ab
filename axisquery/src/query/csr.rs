//! Coordinate batches → compressed sparse row / dense matrices
//!
//! Both builders consume streamed coordinate batches (`soma_dim_0`,
//! `soma_dim_1`, `soma_data`), translate the two join-id dimensions to
//! positions through an [`IndexLike`], and drop records whose row or column
//! is not part of the query result. Duplicate coordinates are summed.
//! Records with a null coordinate or a null value are dropped.

use arrow::array::{Array, AsArray, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float32Type, Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;

use super::indexer::{IndexLike, NOT_FOUND};
use crate::storage::memory::{SOMA_DATA, SOMA_DIM_0, SOMA_DIM_1};
use crate::{QueryError, Result};

/// Translated coordinates of one batch
struct Translated<T> {
    rows: Vec<i64>,
    cols: Vec<i64>,
    data: Vec<T>,
}

fn int64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))?;
    let column = if column.data_type() == &DataType::Int64 {
        column.clone()
    } else {
        cast(column, &DataType::Int64)?
    };
    Ok(column.as_primitive::<Int64Type>().clone())
}

fn data_column(batch: &RecordBatch, as_type: &DataType) -> Result<arrow::array::ArrayRef> {
    let column = batch
        .column_by_name(SOMA_DATA)
        .ok_or_else(|| QueryError::ColumnNotFound(SOMA_DATA.to_string()))?;
    Ok(cast(column, as_type)?)
}

fn translate<T: Copy>(
    batch: &RecordBatch,
    rows: &dyn IndexLike,
    cols: &dyn IndexLike,
    values: impl Fn(&RecordBatch) -> Result<Vec<Option<T>>>,
) -> Result<(Translated<T>, usize)> {
    let dim0 = int64_column(batch, SOMA_DIM_0)?;
    let dim1 = int64_column(batch, SOMA_DIM_1)?;
    let values = values(batch)?;
    let row_pos = rows.get_indexer(dim0.values());
    let col_pos = cols.get_indexer(dim1.values());

    let mut out = Translated {
        rows: Vec::with_capacity(row_pos.len()),
        cols: Vec::with_capacity(col_pos.len()),
        data: Vec::with_capacity(values.len()),
    };
    let mut dropped = 0;
    for (i, ((r, c), v)) in row_pos.into_iter().zip(col_pos).zip(values).enumerate() {
        let keep = r != NOT_FOUND && c != NOT_FOUND && dim0.is_valid(i) && dim1.is_valid(i);
        let v = match v {
            Some(v) if keep => v,
            _ => {
                dropped += 1;
                continue;
            }
        };
        out.rows.push(r);
        out.cols.push(c);
        out.data.push(v);
    }
    Ok((out, dropped))
}

/// Width of an `m`-layer read: one past the largest non-null, non-negative
/// `soma_dim_1` in `batches`.
pub(crate) fn component_extent(batches: &[RecordBatch]) -> Result<usize> {
    let mut extent = 0usize;
    for batch in batches {
        let dim1 = int64_column(batch, SOMA_DIM_1)?;
        for c in dim1.iter().flatten() {
            if c >= 0 {
                extent = extent.max(c as usize + 1);
            }
        }
    }
    Ok(extent)
}

fn f64_values(batch: &RecordBatch) -> Result<Vec<Option<f64>>> {
    let data = data_column(batch, &DataType::Float64)?;
    Ok(data.as_primitive::<Float64Type>().iter().collect())
}

fn f32_values(batch: &RecordBatch) -> Result<Vec<Option<f32>>> {
    let data = data_column(batch, &DataType::Float32)?;
    Ok(data.as_primitive::<Float32Type>().iter().collect())
}

// ============================================================================
// CSR
// ============================================================================

/// Compressed sparse row matrix with `f64` values.
///
/// Column indices are sorted within each row and unique.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    /// An all-zero matrix
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            nrows: shape.0,
            ncols: shape.1,
            indptr: vec![0; shape.0 + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Assemble from coordinate batches. `rows` and `cols` translate
    /// `soma_dim_0` / `soma_dim_1` join ids into positions `< shape`.
    pub fn from_coo_batches<I>(
        batches: I,
        shape: (usize, usize),
        rows: &dyn IndexLike,
        cols: &dyn IndexLike,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Result<RecordBatch>>,
    {
        let mut all_rows = Vec::new();
        let mut all_cols = Vec::new();
        let mut all_data = Vec::new();
        let mut dropped = 0;
        for batch in batches {
            let batch = batch?;
            let (t, d) = translate(&batch, rows, cols, f64_values)?;
            log::trace!("csr batch: {} records, {} dropped", batch.num_rows(), d);
            dropped += d;
            all_rows.extend(t.rows);
            all_cols.extend(t.cols);
            all_data.extend(t.data);
        }

        let matrix = Self::from_triplets(shape, &all_rows, &all_cols, &all_data)?;
        log::debug!(
            "assembled {}x{} csr: {} stored, {} records outside the query",
            shape.0,
            shape.1,
            matrix.nnz(),
            dropped
        );
        Ok(matrix)
    }

    /// Build from parallel coordinate arrays of 0-based positions.
    pub fn from_triplets(
        shape: (usize, usize),
        rows: &[i64],
        cols: &[i64],
        data: &[f64],
    ) -> Result<Self> {
        let (nrows, ncols) = shape;
        if rows.len() != cols.len() || rows.len() != data.len() {
            return Err(QueryError::InvalidArgument(format!(
                "coordinate arrays differ in length: {}, {}, {}",
                rows.len(),
                cols.len(),
                data.len()
            )));
        }
        for (&r, &c) in rows.iter().zip(cols) {
            if r < 0 || r as usize >= nrows || c < 0 || c as usize >= ncols {
                return Err(QueryError::InvalidArgument(format!(
                    "coordinate ({}, {}) outside shape {}x{}",
                    r, c, nrows, ncols
                )));
            }
        }

        // pass 1: count per row
        let mut indptr = vec![0usize; nrows + 1];
        for &r in rows {
            indptr[r as usize + 1] += 1;
        }
        for i in 0..nrows {
            indptr[i + 1] += indptr[i];
        }

        // pass 2: scatter in input order
        let mut next = indptr.clone();
        let mut indices = vec![0usize; rows.len()];
        let mut values = vec![0f64; rows.len()];
        for ((&r, &c), &v) in rows.iter().zip(cols).zip(data) {
            let slot = &mut next[r as usize];
            indices[*slot] = c as usize;
            values[*slot] = v;
            *slot += 1;
        }

        // sort each row by column and sum duplicates, compacting in place
        let mut out_indptr = Vec::with_capacity(nrows + 1);
        out_indptr.push(0);
        let mut write = 0;
        let mut row_buf: Vec<(usize, f64)> = Vec::new();
        for row in 0..nrows {
            row_buf.clear();
            row_buf.extend(
                (indptr[row]..indptr[row + 1]).map(|k| (indices[k], values[k])),
            );
            row_buf.sort_by_key(|&(c, _)| c);
            let mut prev: Option<usize> = None;
            for &(c, v) in &row_buf {
                if prev == Some(c) {
                    values[write - 1] += v;
                } else {
                    indices[write] = c;
                    values[write] = v;
                    write += 1;
                    prev = Some(c);
                }
            }
            out_indptr.push(write);
        }
        indices.truncate(write);
        values.truncate(write);

        Ok(Self {
            nrows,
            ncols,
            indptr: out_indptr,
            indices,
            data: values,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Column indices and values stored in `row`.
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        if row >= self.nrows {
            return (&[], &[]);
        }
        let range = self.indptr[row]..self.indptr[row + 1];
        (&self.indices[range.clone()], &self.data[range])
    }

    /// Stored value at `(row, col)`; absent entries are `None`.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let (cols, vals) = self.row(row);
        cols.binary_search(&col).ok().map(|i| vals[i])
    }

    /// Row-major dense copy
    pub fn to_dense(&self) -> Vec<f64> {
        let mut dense = vec![0f64; self.nrows * self.ncols];
        for row in 0..self.nrows {
            let (cols, vals) = self.row(row);
            for (&c, &v) in cols.iter().zip(vals) {
                dense[row * self.ncols + c] = v;
            }
        }
        dense
    }
}

// ============================================================================
// Dense
// ============================================================================

/// Row-major dense matrix with `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f32>,
}

impl DenseMatrix {
    /// All-zero matrix. Fails when `nrows * ncols` overflows `usize`.
    pub fn zeros(shape: (usize, usize)) -> Result<Self> {
        let len = shape.0.checked_mul(shape.1).ok_or_else(|| {
            QueryError::InvalidArgument(format!(
                "dense shape {}x{} is too large",
                shape.0, shape.1
            ))
        })?;
        Ok(Self {
            nrows: shape.0,
            ncols: shape.1,
            data: vec![0f32; len],
        })
    }

    /// Scatter coordinate batches into a zeroed matrix.
    pub fn from_coo_batches<I>(
        batches: I,
        shape: (usize, usize),
        rows: &dyn IndexLike,
        cols: &dyn IndexLike,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = Result<RecordBatch>>,
    {
        let mut matrix = Self::zeros(shape)?;
        for batch in batches {
            let (t, _) = translate(&batch?, rows, cols, f32_values)?;
            for ((r, c), v) in t.rows.into_iter().zip(t.cols).zip(t.data) {
                let (r, c) = (r as usize, c as usize);
                if r < matrix.nrows && c < matrix.ncols {
                    matrix.data[r * matrix.ncols + c] += v;
                }
            }
        }
        Ok(matrix)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.nrows && col < self.ncols {
            Some(self.data[row * self.ncols + col])
        } else {
            None
        }
    }

    /// Values of `row`; empty when `row` is out of range.
    pub fn row(&self, row: usize) -> &[f32] {
        if row >= self.nrows {
            return &[];
        }
        &self.data[row * self.ncols..(row + 1) * self.ncols]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::indexer::{HashJoinIdIndex, PositionalIndex};
    use arrow::array::{Float64Array, Int32Array};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn coo_batch(records: &[(i64, i64, f64)]) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_DIM_0, DataType::Int64, false),
            Field::new(SOMA_DIM_1, DataType::Int64, false),
            Field::new(SOMA_DATA, DataType::Float64, false),
        ]));
        Ok(RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.0))),
                Arc::new(Int64Array::from_iter_values(records.iter().map(|r| r.1))),
                Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.2))),
            ],
        )?)
    }

    #[test]
    fn test_assemble_drops_records_outside_query() {
        let rows = HashJoinIdIndex::new(&[2, 5, 9]);
        let cols = HashJoinIdIndex::new(&[0, 1, 2, 3]);
        let batches = vec![
            coo_batch(&[(2, 1, 4.0), (5, 3, 1.5)]),
            coo_batch(&[(9, 0, 2.0), (7, 1, 9.0)]),
        ];
        let m = CsrMatrix::from_coo_batches(batches, (3, 4), &rows, &cols).unwrap();

        assert_eq!(m.shape(), (3, 4));
        assert_eq!(m.nnz(), 3);
        assert_eq!(m.get(0, 1), Some(4.0));
        assert_eq!(m.get(1, 3), Some(1.5));
        assert_eq!(m.get(2, 0), Some(2.0));
        assert_eq!(m.get(0, 0), None);
        assert_eq!(m.indptr(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_duplicates_summed_and_rows_sorted() {
        let rows = HashJoinIdIndex::new(&[10, 20]);
        let cols = HashJoinIdIndex::new(&[0, 1, 2]);
        let batches = vec![coo_batch(&[(10, 2, 1.0), (10, 0, 2.0), (10, 2, 0.5), (20, 1, 3.0)])];
        let m = CsrMatrix::from_coo_batches(batches, (2, 3), &rows, &cols).unwrap();

        assert_eq!(m.row(0), (&[0usize, 2][..], &[2.0, 1.5][..]));
        assert_eq!(m.row(1), (&[1usize][..], &[3.0][..]));
        assert_eq!(m.to_dense(), vec![2.0, 0.0, 1.5, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn test_empty_intersection() {
        let rows = HashJoinIdIndex::new(&[]);
        let cols = HashJoinIdIndex::new(&[0, 1]);
        let m = CsrMatrix::from_coo_batches(vec![coo_batch(&[(1, 1, 1.0)])], (0, 2), &rows, &cols)
            .unwrap();
        assert_eq!(m, CsrMatrix::empty((0, 2)));
        assert_eq!(m.indptr(), &[0]);
    }

    #[test]
    fn test_batch_errors_propagate() {
        let rows = HashJoinIdIndex::new(&[0]);
        let batches = vec![
            coo_batch(&[(0, 0, 1.0)]),
            Err(QueryError::Storage("disk gone".into())),
        ];
        let err = CsrMatrix::from_coo_batches(batches, (1, 1), &rows, &rows).unwrap_err();
        assert!(matches!(err, QueryError::Storage(_)));
    }

    #[test]
    fn test_from_triplets_rejects_out_of_shape() {
        let err = CsrMatrix::from_triplets((2, 2), &[0, 2], &[0, 0], &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn test_dense_from_integer_data() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_DIM_0, DataType::Int64, false),
            Field::new(SOMA_DIM_1, DataType::Int64, false),
            Field::new(SOMA_DATA, DataType::Int32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![7, 3, 7, 7])),
                Arc::new(Int64Array::from(vec![1, 0, 1, 5])),
                Arc::new(Int32Array::from(vec![2, 4, 3, 9])),
            ],
        )
        .unwrap();
        let rows = HashJoinIdIndex::new(&[3, 7]);
        let cols = PositionalIndex::new(2);
        let m = DenseMatrix::from_coo_batches(vec![Ok(batch)], (2, 2), &rows, &cols).unwrap();

        assert_eq!(m.data(), &[4.0, 0.0, 0.0, 5.0]);
        assert_eq!(m.get(1, 1), Some(5.0));
        assert_eq!(m.get(2, 0), None);
        assert!(m.row(2).is_empty());
    }

    #[test]
    fn test_null_coordinates_and_values_dropped() {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_DIM_0, DataType::Int64, true),
            Field::new(SOMA_DIM_1, DataType::Int64, true),
            Field::new(SOMA_DATA, DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(0), None, Some(1), Some(1)])),
                Arc::new(Int64Array::from(vec![Some(0), Some(1), None, Some(1)])),
                Arc::new(Float64Array::from(vec![Some(1.0), Some(2.0), Some(3.0), None])),
            ],
        )
        .unwrap();
        let index = PositionalIndex::new(2);
        let m = CsrMatrix::from_coo_batches(vec![Ok(batch)], (2, 2), &index, &index).unwrap();

        assert_eq!(m.nnz(), 1);
        assert_eq!(m.get(0, 0), Some(1.0));
        assert_eq!(m.get(1, 1), None);
    }

    #[test]
    fn test_dense_zeros_rejects_overflowing_shape() {
        let err = DenseMatrix::zeros((10, usize::MAX / 2)).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
        assert_eq!(DenseMatrix::zeros((2, 3)).unwrap().data(), &[0.0; 6]);
    }

    #[test]
    fn test_component_extent() {
        let batches = vec![
            coo_batch(&[(0, 4, 1.0), (1, 1, 1.0)]).unwrap(),
            coo_batch(&[(2, -1, 1.0)]).unwrap(),
        ];
        assert_eq!(component_extent(&batches).unwrap(), 5);
        assert_eq!(component_extent(&[]).unwrap(), 0);
    }
}
