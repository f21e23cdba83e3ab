//! Lazy read handles

use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use super::{BatchStream, ScanRequest, ScanSource, SparseNDArray};
use crate::options::CoordSelector;
use crate::{QueryError, Result};

/// Restartable, finite, lazy sequence of table batches.
///
/// Nothing is read until the first call to `next`; `restart` rewinds to a
/// fresh scan with the same request. Iteration stops after the first error.
pub struct ReadIter<S: ScanSource + ?Sized> {
    source: Arc<S>,
    request: ScanRequest,
    stream: Option<BatchStream>,
    done: bool,
}

impl<S: ScanSource + ?Sized> ReadIter<S> {
    pub fn new(source: Arc<S>, request: ScanRequest) -> Self {
        Self {
            source,
            request,
            stream: None,
            done: false,
        }
    }

    pub fn request(&self) -> &ScanRequest {
        &self.request
    }

    /// Rewind to the beginning of the scan.
    pub fn restart(&mut self) {
        self.stream = None;
        self.done = false;
    }

    /// Schema of the batches this read yields.
    pub fn schema(&self) -> Result<SchemaRef> {
        let schema = self.source.schema();
        match &self.request.column_names {
            None => Ok(schema),
            Some(columns) => {
                let indices = columns
                    .iter()
                    .map(|name| {
                        schema
                            .index_of(name)
                            .map_err(|_| QueryError::ColumnNotFound(name.clone()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(schema.project(&indices)?))
            }
        }
    }

    /// Drain the remaining batches into a single batch.
    pub fn concat(self) -> Result<RecordBatch> {
        let fallback = self.schema()?;
        let batches = self.collect::<Result<Vec<_>>>()?;
        let schema = batches.first().map(|b| b.schema()).unwrap_or(fallback);
        Ok(concat_batches(&schema, &batches)?)
    }
}

impl<S: ScanSource + ?Sized> Iterator for ReadIter<S> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.stream.is_none() {
            match self.source.scan(&self.request) {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let item = self.stream.as_mut().and_then(Iterator::next);
        match &item {
            None | Some(Err(_)) => self.done = true,
            Some(Ok(_)) => {}
        }
        item
    }
}

/// A sparse read scoped to a coordinate selection on a sparse array.
#[derive(Clone)]
pub struct SparseRead {
    array: Arc<dyn SparseNDArray>,
    request: ScanRequest,
}

impl SparseRead {
    pub fn new(array: Arc<dyn SparseNDArray>, request: ScanRequest) -> Self {
        Self { array, request }
    }

    /// Coordinate selectors, one per dimension
    pub fn coords(&self) -> &[CoordSelector] {
        &self.request.coords
    }

    /// Declared shape of the underlying (unfiltered) array
    pub fn shape(&self) -> Vec<u64> {
        self.array.shape()
    }

    /// Coordinate-format batches (`soma_dim_0`, `soma_dim_1`, `soma_data`).
    pub fn tables(&self) -> ReadIter<dyn SparseNDArray> {
        ReadIter::new(self.array.clone(), self.request.clone())
    }
}

impl std::fmt::Debug for SparseRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseRead")
            .field("shape", &self.shape())
            .field("request", &self.request)
            .finish()
    }
}
