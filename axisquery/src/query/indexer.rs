//! Join id → positional index mapping
//!
//! An index is built over an axis' resolved join ids; `get_indexer` maps
//! arbitrary join ids to their 0-based position in that array, or
//! [`NOT_FOUND`] when the id is not part of the query result.

use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{Array, Int64Array};
use once_cell::sync::OnceCell;
use rayon::prelude::*;

use super::joinids::JoinIdCache;
use crate::axis::{Axis, AxisPair};
use crate::Result;

/// Position reported for ids absent from the index
pub const NOT_FOUND: i64 = -1;

/// Inputs larger than this are mapped in parallel
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Re-indexing contract: map join ids to positions.
pub trait IndexLike: Send + Sync {
    /// Positions of `ids`, with [`NOT_FOUND`] for unknown ids.
    fn get_indexer(&self, ids: &[i64]) -> Vec<i64>;

    /// Number of ids the index was built from
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds an index over a join id array.
pub type IndexFactory = Arc<dyn Fn(&[i64]) -> Arc<dyn IndexLike> + Send + Sync>;

/// Default factory: hash-based lookups.
pub fn hash_index_factory() -> IndexFactory {
    Arc::new(|ids: &[i64]| Arc::new(HashJoinIdIndex::new(ids)) as Arc<dyn IndexLike>)
}

/// Factory for binary-search lookups over a sorted copy of the ids.
pub fn sorted_index_factory() -> IndexFactory {
    Arc::new(|ids: &[i64]| Arc::new(SortedJoinIdIndex::new(ids)) as Arc<dyn IndexLike>)
}

fn map_ids(ids: &[i64], lookup: impl Fn(i64) -> i64 + Send + Sync) -> Vec<i64> {
    if ids.len() >= PARALLEL_THRESHOLD {
        ids.par_iter().map(|&id| lookup(id)).collect()
    } else {
        ids.iter().map(|&id| lookup(id)).collect()
    }
}

// ============================================================================
// Hash index
// ============================================================================

/// Hash map from join id to position. Duplicate ids keep their first position.
#[derive(Debug, Clone)]
pub struct HashJoinIdIndex {
    positions: AHashMap<i64, i64>,
    len: usize,
}

impl HashJoinIdIndex {
    pub fn new(ids: &[i64]) -> Self {
        let mut positions = AHashMap::with_capacity(ids.len());
        for (pos, &id) in ids.iter().enumerate() {
            positions.entry(id).or_insert(pos as i64);
        }
        Self {
            positions,
            len: ids.len(),
        }
    }
}

impl IndexLike for HashJoinIdIndex {
    fn get_indexer(&self, ids: &[i64]) -> Vec<i64> {
        map_ids(ids, |id| self.positions.get(&id).copied().unwrap_or(NOT_FOUND))
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// Sorted index
// ============================================================================

/// Sorted `(id, position)` pairs searched with binary search.
#[derive(Debug, Clone)]
pub struct SortedJoinIdIndex {
    entries: Vec<(i64, i64)>,
    len: usize,
}

impl SortedJoinIdIndex {
    pub fn new(ids: &[i64]) -> Self {
        let mut entries: Vec<(i64, i64)> =
            ids.iter().enumerate().map(|(pos, &id)| (id, pos as i64)).collect();
        // stable sort + dedup keeps the first position of each id
        entries.sort_by_key(|&(id, _)| id);
        entries.dedup_by_key(|&mut (id, _)| id);
        Self {
            entries,
            len: ids.len(),
        }
    }
}

impl IndexLike for SortedJoinIdIndex {
    fn get_indexer(&self, ids: &[i64]) -> Vec<i64> {
        map_ids(ids, |id| {
            match self.entries.binary_search_by_key(&id, |&(key, _)| key) {
                Ok(i) => self.entries[i].1,
                Err(_) => NOT_FOUND,
            }
        })
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Identity mapping over `0..len`; ids outside the range are [`NOT_FOUND`].
/// Used for the component dimension of `obsm`/`varm` layers.
#[derive(Debug, Clone, Copy)]
pub struct PositionalIndex {
    len: usize,
}

impl PositionalIndex {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl IndexLike for PositionalIndex {
    fn get_indexer(&self, ids: &[i64]) -> Vec<i64> {
        let len = self.len as i64;
        map_ids(ids, |id| if (0..len).contains(&id) { id } else { NOT_FOUND })
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// Axis indexer
// ============================================================================

/// Per-axis indexes over a query's resolved join ids, built on first use.
pub struct AxisIndexer {
    joinids: Arc<JoinIdCache>,
    factory: IndexFactory,
    slots: AxisPair<OnceCell<Arc<dyn IndexLike>>>,
}

impl AxisIndexer {
    pub fn new(joinids: Arc<JoinIdCache>, factory: IndexFactory) -> Self {
        Self {
            joinids,
            factory,
            slots: AxisPair::default(),
        }
    }

    /// The index for `axis`, resolving its join ids if needed.
    pub fn index_for(&self, axis: Axis) -> Result<Arc<dyn IndexLike>> {
        axis.get_from(&self.slots)
            .get_or_try_init(|| {
                let ids = self.joinids.resolve(axis)?;
                Ok((self.factory)(ids.values()))
            })
            .cloned()
    }

    /// Positions of `coords` along `axis`.
    pub fn reindex(&self, axis: Axis, coords: &[i64]) -> Result<Vec<i64>> {
        Ok(self.index_for(axis)?.get_indexer(coords))
    }

    pub fn by_obs(&self, coords: &Int64Array) -> Result<Vec<i64>> {
        self.reindex_array(Axis::Obs, coords)
    }

    pub fn by_var(&self, coords: &Int64Array) -> Result<Vec<i64>> {
        self.reindex_array(Axis::Var, coords)
    }

    /// Null coordinates map to [`NOT_FOUND`].
    fn reindex_array(&self, axis: Axis, coords: &Int64Array) -> Result<Vec<i64>> {
        let mut positions = self.reindex(axis, coords.values())?;
        if let Some(nulls) = coords.nulls() {
            for (pos, valid) in positions.iter_mut().zip(nulls.iter()) {
                if !valid {
                    *pos = NOT_FOUND;
                }
            }
        }
        Ok(positions)
    }
}

impl std::fmt::Debug for AxisIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxisIndexer")
            .field("obs_built", &self.slots.obs.get().is_some())
            .field("var_built", &self.slots.var.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AxisQuery;
    use crate::storage::{DataFrame, MemoryDataFrame};
    use crate::SOMA_JOINID;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn make_frame(ids: Vec<i64>) -> Arc<dyn DataFrame> {
        let schema = Arc::new(Schema::new(vec![Field::new(SOMA_JOINID, DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(ids))]).unwrap();
        Arc::new(MemoryDataFrame::new(batch).unwrap())
    }

    #[test]
    fn test_hash_and_sorted_agree() {
        let ids = [9, 2, 5, 2, 40];
        let probe = [5, 2, 9, 7, 40, -3];
        let expected = vec![2, 1, 0, NOT_FOUND, 4, NOT_FOUND];
        assert_eq!(HashJoinIdIndex::new(&ids).get_indexer(&probe), expected);
        assert_eq!(SortedJoinIdIndex::new(&ids).get_indexer(&probe), expected);
        assert_eq!(SortedJoinIdIndex::new(&ids).len(), 5);
    }

    #[test]
    fn test_positional_index_bounds() {
        let index = PositionalIndex::new(3);
        assert_eq!(index.get_indexer(&[0, 2, 3, -1]), vec![0, 2, NOT_FOUND, NOT_FOUND]);
    }

    #[test]
    fn test_large_input_parallel_path() {
        let ids: Vec<i64> = (0..100_000).map(|i| i * 3).collect();
        let index = HashJoinIdIndex::new(&ids);
        let probe: Vec<i64> = (0..100_000).collect();
        let positions = index.get_indexer(&probe);
        assert_eq!(positions[0], 0);
        assert_eq!(positions[1], NOT_FOUND);
        assert_eq!(positions[99_999], 33_333);
        assert_eq!(positions.iter().filter(|&&p| p != NOT_FOUND).count(), 33_334);
    }

    #[test]
    fn test_axis_indexer_reindex() {
        let cache = JoinIdCache::new(
            AxisPair::new(make_frame(vec![2, 5, 9]), make_frame(vec![0, 1, 2, 3])),
            Arc::new(AxisPair::new(AxisQuery::all(), AxisQuery::all())),
        );
        let indexer = AxisIndexer::new(Arc::new(cache), sorted_index_factory());

        let rows = indexer.by_obs(&Int64Array::from(vec![9, 7, 2, 5])).unwrap();
        assert_eq!(rows, vec![2, NOT_FOUND, 0, 1]);
        let cols = indexer.reindex(Axis::Var, &[3, 4]).unwrap();
        assert_eq!(cols, vec![3, NOT_FOUND]);
        assert_eq!(indexer.index_for(Axis::Var).unwrap().len(), 4);
    }

    #[test]
    fn test_null_coordinates_not_found() {
        let cache = JoinIdCache::new(
            AxisPair::new(make_frame(vec![0, 5]), make_frame(vec![0, 1])),
            Arc::new(AxisPair::new(AxisQuery::all(), AxisQuery::all())),
        );
        let indexer = AxisIndexer::new(Arc::new(cache), hash_index_factory());

        // the null slot holds 0, a valid join id
        let coords = Int64Array::from(vec![Some(5), None, Some(0)]);
        assert_eq!(indexer.by_obs(&coords).unwrap(), vec![1, NOT_FOUND, 0]);
        assert_eq!(indexer.by_var(&coords).unwrap(), vec![NOT_FOUND, NOT_FOUND, 0]);
    }
}
