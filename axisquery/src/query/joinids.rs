//! Per-axis join-id cache
//!
//! Each axis slot is written at most once. Concurrent first callers block on
//! the single initializer instead of issuing their own scan, and every path
//! that fills a slot (explicit resolve, side-channel table read, direct
//! injection) goes through the same cell, so the first writer wins and all
//! later readers observe its value.

use std::sync::Arc;
use std::time::Instant;

use arrow::array::{Array, Int64Array};
use arrow::record_batch::RecordBatch;
use once_cell::sync::OnceCell;

use crate::axis::{Axis, AxisPair};
use crate::options::AxisQuery;
use crate::storage::{DataFrame, ReadIter, ScanRequest};
use crate::{QueryError, Result, SOMA_JOINID};

/// Lazily resolved join ids for both axes of one query.
pub struct JoinIdCache {
    frames: AxisPair<Arc<dyn DataFrame>>,
    queries: Arc<AxisPair<AxisQuery>>,
    slots: AxisPair<OnceCell<Int64Array>>,
}

impl JoinIdCache {
    pub fn new(frames: AxisPair<Arc<dyn DataFrame>>, queries: Arc<AxisPair<AxisQuery>>) -> Self {
        Self {
            frames,
            queries,
            slots: AxisPair::default(),
        }
    }

    /// Join ids for `axis`, scanning the axis table on first use.
    pub fn resolve(&self, axis: Axis) -> Result<Int64Array> {
        axis.get_from(&self.slots)
            .get_or_try_init(|| self.load(axis))
            .cloned()
    }

    /// Resolve both axes concurrently on `pool`. Blocks until both finish;
    /// the `obs` failure is reported first when both fail.
    pub fn preload(&self, pool: &rayon::ThreadPool) -> Result<()> {
        if self.is_cached(Axis::Obs) && self.is_cached(Axis::Var) {
            return Ok(());
        }
        let (obs, var) = pool.join(|| self.resolve(Axis::Obs), || self.resolve(Axis::Var));
        obs?;
        var?;
        Ok(())
    }

    pub fn is_cached(&self, axis: Axis) -> bool {
        axis.get_from(&self.slots).get().is_some()
    }

    /// Inject join ids obtained elsewhere. Returns false if the slot was
    /// already filled, in which case the existing value is kept.
    pub fn fill(&self, axis: Axis, joinids: Int64Array) -> bool {
        axis.get_from(&self.slots).set(joinids).is_ok()
    }

    /// Run `read` as the populating scan for `axis` unless the slot is
    /// already (or concurrently being) filled. `read` returns the join ids
    /// plus an extra output; the extra output is handed back only when this
    /// call's read was the one that filled the slot.
    pub(crate) fn resolve_with<T>(
        &self,
        axis: Axis,
        read: impl FnOnce() -> Result<(Int64Array, T)>,
    ) -> Result<Option<T>> {
        let mut output = None;
        axis.get_from(&self.slots).get_or_try_init(|| {
            let (joinids, extra) = read()?;
            output = Some(extra);
            Ok::<_, QueryError>(joinids)
        })?;
        Ok(output)
    }

    fn load(&self, axis: Axis) -> Result<Int64Array> {
        let started = Instant::now();
        let request = ScanRequest::for_axis(axis.get_from(&*self.queries))
            .with_columns(Some(vec![SOMA_JOINID.to_string()]));
        let table = ReadIter::new(axis.get_from(&self.frames).clone(), request).concat()?;
        let joinids = joinid_column(&table)?;
        log::debug!(
            "resolved {} {} join ids in {:?}",
            joinids.len(),
            axis,
            started.elapsed()
        );
        Ok(joinids)
    }
}

/// Extract the `soma_joinid` column of a concatenated axis table.
pub(crate) fn joinid_column(table: &RecordBatch) -> Result<Int64Array> {
    table
        .column_by_name(SOMA_JOINID)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .cloned()
        .ok_or_else(|| QueryError::ColumnNotFound(SOMA_JOINID.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use crate::storage::{MemoryDataFrame, MemoryTable};
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field, Schema};

    fn make_frame(ids: Vec<i64>, labels: Vec<&str>) -> (Arc<dyn DataFrame>, Arc<MemoryTable>) {
        let schema = Arc::new(Schema::new(vec![
            Field::new(SOMA_JOINID, DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(labels)),
            ],
        )
        .unwrap();
        let frame = MemoryDataFrame::new(batch).unwrap();
        let table = frame.table();
        (Arc::new(frame), table)
    }

    fn make_cache() -> (JoinIdCache, Arc<MemoryTable>, Arc<MemoryTable>) {
        let (obs, obs_table) = make_frame(vec![9, 2, 5, 7], vec!["A", "A", "A", "B"]);
        let (var, var_table) = make_frame(vec![0, 1, 2], vec!["x", "y", "z"]);
        let queries = AxisPair::new(
            AxisQuery::all().with_value_filter(Filter::eq("label", "A")),
            AxisQuery::all(),
        );
        let cache = JoinIdCache::new(AxisPair::new(obs, var), Arc::new(queries));
        (cache, obs_table, var_table)
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let (cache, obs_table, _) = make_cache();
        assert!(!cache.is_cached(Axis::Obs));

        let first = cache.resolve(Axis::Obs).unwrap();
        let second = cache.resolve(Axis::Obs).unwrap();
        assert_eq!(first.values().to_vec(), vec![9, 2, 5]);
        assert_eq!(first, second);
        assert_eq!(obs_table.scan_count(), 1);
        assert!(cache.is_cached(Axis::Obs));
        assert!(!cache.is_cached(Axis::Var));
    }

    #[test]
    fn test_preload_both_axes() {
        let (cache, obs_table, var_table) = make_cache();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        cache.preload(&pool).unwrap();
        cache.preload(&pool).unwrap();
        assert!(cache.is_cached(Axis::Obs) && cache.is_cached(Axis::Var));
        assert_eq!(obs_table.scan_count(), 1);
        assert_eq!(var_table.scan_count(), 1);
    }

    #[test]
    fn test_fill_first_writer_wins() {
        let (cache, obs_table, _) = make_cache();
        assert!(cache.fill(Axis::Obs, Int64Array::from(vec![2, 5])));
        assert!(!cache.fill(Axis::Obs, Int64Array::from(vec![1])));
        assert_eq!(cache.resolve(Axis::Obs).unwrap().values().to_vec(), vec![2, 5]);
        assert_eq!(obs_table.scan_count(), 0);
    }

    #[test]
    fn test_resolve_with_only_reports_winning_read() {
        let (cache, _, var_table) = make_cache();
        let won = cache
            .resolve_with(Axis::Var, || Ok((Int64Array::from(vec![1, 2]), "table")))
            .unwrap();
        assert_eq!(won, Some("table"));

        let lost = cache
            .resolve_with(Axis::Var, || Ok((Int64Array::from(vec![0]), "other")))
            .unwrap();
        assert_eq!(lost, None);
        assert_eq!(cache.resolve(Axis::Var).unwrap().values().to_vec(), vec![1, 2]);
        assert_eq!(var_table.scan_count(), 0);
    }

    #[test]
    fn test_scan_failure_propagates_and_leaves_slot_empty() {
        let (obs, _) = make_frame(vec![1], vec!["A"]);
        let (var, _) = make_frame(vec![1], vec!["x"]);
        let queries = AxisPair::new(
            AxisQuery::all().with_value_filter(Filter::eq("missing", 1i64)),
            AxisQuery::all(),
        );
        let cache = JoinIdCache::new(AxisPair::new(obs, var), Arc::new(queries));

        let err = cache.resolve(Axis::Obs).unwrap_err();
        assert!(matches!(err, QueryError::ColumnNotFound(ref c) if c == "missing"));
        assert!(!cache.is_cached(Axis::Obs));
    }
}
