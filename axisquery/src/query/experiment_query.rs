//! Axis-filtered queries over one measurement of an experiment
//!
//! An [`ExperimentAxisQuery`] binds an `obs` query and a `var` query to one
//! measurement. Join ids are resolved lazily and at most once per axis;
//! matrix reads are restricted to the cartesian product of the two
//! resolved join-id sets. [`ExperimentAxisQuery::read`] fans the whole
//! materialization out onto the experiment's worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet;
use arrow::array::{AsArray, Int64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use super::csr::{component_extent, CsrMatrix, DenseMatrix};
use super::filter::{CompareOp, Filter};
use super::indexer::{hash_index_factory, AxisIndexer, IndexFactory, PositionalIndex};
use super::joinids::{joinid_column, JoinIdCache};
use super::result::{strip_column, AxisQueryResult};
use crate::axis::{Axis, AxisPair};
use crate::context::SomaContext;
use crate::options::{AxisQuery, CoordSelector, ReadOptions, ResultOrder, ScanOptions};
use crate::storage::{
    AxisMatrices, Collection, DataFrame, Experiment, Layer, LayerKind, Measurement, ReadIter,
    ScanRequest, SparseNDArray, SparseRead,
};
use crate::{QueryError, Result, SOMA_JOINID};

/// Name of the main matrix collection
const X_COLLECTION: &str = "X";

/// Presence frame columns read by the scene lookup
const SCENE_ID: &str = "scene_id";
const PRESENCE_DATA: &str = "data";

/// Result slot of one fan-out task
type Slot<T> = Option<Result<T>>;

type NamedLayers = Vec<(String, Arc<dyn SparseNDArray>)>;

/// Validated `m` and `p` layers of one axis
#[derive(Default)]
struct AuxLayers {
    m: NamedLayers,
    p: NamedLayers,
}

fn take_slot<T>(slot: Slot<T>, task: &str) -> Result<T> {
    slot.unwrap_or_else(|| Err(QueryError::Task(task.to_string())))
}

/// A query against one measurement, restricted along both axes.
pub struct ExperimentAxisQuery {
    measurement_name: String,
    measurement: Arc<Measurement>,
    frames: AxisPair<Arc<dyn DataFrame>>,
    obs_spatial_presence: Option<Arc<dyn DataFrame>>,
    queries: Arc<AxisPair<AxisQuery>>,
    joinids: Arc<JoinIdCache>,
    indexer: Arc<AxisIndexer>,
    context: Arc<SomaContext>,
    closed: AtomicBool,
}

impl ExperimentAxisQuery {
    /// Bind the two axis queries to `measurement_name`. Missing queries
    /// select every row of their axis.
    pub fn new(
        experiment: &Experiment,
        measurement_name: &str,
        obs_query: Option<AxisQuery>,
        var_query: Option<AxisQuery>,
    ) -> Result<Self> {
        let measurement = experiment
            .ms
            .get(measurement_name)
            .cloned()
            .ok_or_else(|| QueryError::MeasurementNotFound(measurement_name.to_string()))?;

        let frames = AxisPair::new(experiment.obs.clone(), measurement.var.clone());
        let queries = Arc::new(AxisPair::new(
            obs_query.unwrap_or_default(),
            var_query.unwrap_or_default(),
        ));
        let joinids = Arc::new(JoinIdCache::new(frames.clone(), queries.clone()));
        let indexer = Arc::new(AxisIndexer::new(joinids.clone(), hash_index_factory()));

        log::debug!("opened axis query on measurement '{}'", measurement_name);
        Ok(Self {
            measurement_name: measurement_name.to_string(),
            measurement,
            frames,
            obs_spatial_presence: experiment.obs_spatial_presence.clone(),
            queries,
            joinids,
            indexer,
            context: experiment.context().clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Use `factory` to build the per-axis join-id indexes.
    pub fn with_index_factory(mut self, factory: IndexFactory) -> Self {
        self.indexer = Arc::new(AxisIndexer::new(self.joinids.clone(), factory));
        self
    }

    pub fn measurement_name(&self) -> &str {
        &self.measurement_name
    }

    pub fn query(&self, axis: Axis) -> &AxisQuery {
        axis.get_from(&*self.queries)
    }

    // ========================================================================
    // Axis tables and join ids
    // ========================================================================

    /// Lazy read of the filtered `obs` table.
    pub fn obs(&self, options: &ScanOptions) -> ReadIter<dyn DataFrame> {
        self.axis_table(Axis::Obs, options)
    }

    /// Lazy read of the filtered `var` table.
    pub fn var(&self, options: &ScanOptions) -> ReadIter<dyn DataFrame> {
        self.axis_table(Axis::Var, options)
    }

    pub fn axis_table(&self, axis: Axis, options: &ScanOptions) -> ReadIter<dyn DataFrame> {
        let request = ScanRequest::for_axis(self.query(axis)).with_options(options);
        ReadIter::new(axis.get_from(&self.frames).clone(), request)
    }

    pub fn obs_joinids(&self) -> Result<Int64Array> {
        self.joinids(Axis::Obs)
    }

    pub fn var_joinids(&self) -> Result<Int64Array> {
        self.joinids(Axis::Var)
    }

    pub fn joinids(&self, axis: Axis) -> Result<Int64Array> {
        self.joinids.resolve(axis)
    }

    pub fn n_obs(&self) -> Result<usize> {
        self.count(Axis::Obs)
    }

    pub fn n_vars(&self) -> Result<usize> {
        self.count(Axis::Var)
    }

    pub fn count(&self, axis: Axis) -> Result<usize> {
        Ok(self.joinids(axis)?.len())
    }

    pub fn indexer(&self) -> Arc<AxisIndexer> {
        self.indexer.clone()
    }

    // ========================================================================
    // Matrix reads
    // ========================================================================

    /// Sparse read of an `X` layer restricted to `obs × var` join ids.
    pub fn x(&self, layer_name: &str, options: &ScanOptions) -> Result<SparseRead> {
        let array = self.x_layer(layer_name)?;
        self.joinids.preload(self.context.threadpool())?;
        let coords = vec![
            CoordSelector::Ids(self.obs_joinids()?),
            CoordSelector::Ids(self.var_joinids()?),
        ];
        Ok(SparseRead::new(array, ScanRequest::for_coords(coords).with_options(options)))
    }

    pub fn obsp(&self, layer_name: &str) -> Result<SparseRead> {
        self.axis_matrix(Axis::Obs, AxisMatrices::Pairwise, layer_name)
    }

    pub fn varp(&self, layer_name: &str) -> Result<SparseRead> {
        self.axis_matrix(Axis::Var, AxisMatrices::Pairwise, layer_name)
    }

    pub fn obsm(&self, layer_name: &str) -> Result<SparseRead> {
        self.axis_matrix(Axis::Obs, AxisMatrices::Multi, layer_name)
    }

    pub fn varm(&self, layer_name: &str) -> Result<SparseRead> {
        self.axis_matrix(Axis::Var, AxisMatrices::Multi, layer_name)
    }

    fn axis_matrix(&self, axis: Axis, kind: AxisMatrices, layer_name: &str) -> Result<SparseRead> {
        let array = self.aux_layer(axis, kind, layer_name)?;
        let ids = self.joinids(axis)?;
        let coords = match kind {
            AxisMatrices::Pairwise => vec![CoordSelector::Ids(ids.clone()), CoordSelector::Ids(ids)],
            AxisMatrices::Multi => vec![CoordSelector::Ids(ids)],
        };
        Ok(SparseRead::new(array, ScanRequest::for_coords(coords)))
    }

    fn x_layer(&self, name: &str) -> Result<Arc<dyn SparseNDArray>> {
        sparse_member(&self.measurement.x, X_COLLECTION, name)
    }

    fn aux_layer(
        &self,
        axis: Axis,
        kind: AxisMatrices,
        name: &str,
    ) -> Result<Arc<dyn SparseNDArray>> {
        let collection_name = kind.collection_name(axis);
        let collection = self
            .measurement
            .axis_matrices(axis, kind)
            .ok_or_else(|| QueryError::CollectionNotFound(collection_name.clone()))?;
        sparse_member(collection, &collection_name, name)
    }

    // ========================================================================
    // Materializing read
    // ========================================================================

    /// Read the axis tables, the `x_name` layer and every layer named in
    /// `options` into memory.
    ///
    /// All names are validated before any I/O. The reads then run
    /// concurrently on the experiment's pool; if any of them fails, the
    /// first failure in submission order is returned and nothing else.
    pub fn read(&self, x_name: &str, options: &ReadOptions) -> Result<AxisQueryResult> {
        let started = Instant::now();

        let x_main = self.x_layer(x_name)?;
        let x_extra = options
            .x_layers
            .iter()
            .map(|name| Ok((name.clone(), self.x_layer(name)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut aux: AxisPair<AuxLayers> = AxisPair::default();
        for axis in Axis::ALL {
            *axis.get_mut_from(&mut aux) = AuxLayers {
                m: self.aux_layers(
                    axis,
                    AxisMatrices::Multi,
                    axis.get_from(&options.m_layers).as_slice(),
                )?,
                p: self.aux_layers(
                    axis,
                    AxisMatrices::Pairwise,
                    axis.get_from(&options.p_layers).as_slice(),
                )?,
            };
        }

        log::debug!(
            "materializing '{}' with {} extra X layers on measurement '{}'",
            x_name,
            x_extra.len(),
            self.measurement_name
        );

        let mut obs_slot: Slot<RecordBatch> = None;
        let mut var_slot: Slot<RecordBatch> = None;
        let mut x_slot: Slot<CsrMatrix> = None;
        let mut x_extra_slots: Vec<Slot<CsrMatrix>> = x_extra.iter().map(|_| None).collect();
        let mut obsm_slot: Slot<HashMap<String, DenseMatrix>> = None;
        let mut obsp_slot: Slot<HashMap<String, DenseMatrix>> = None;
        let mut varm_slot: Slot<HashMap<String, DenseMatrix>> = None;
        let mut varp_slot: Slot<HashMap<String, DenseMatrix>> = None;

        self.context.threadpool().scope(|s| {
            let obs_out = &mut obs_slot;
            let var_out = &mut var_slot;
            let x_out = &mut x_slot;
            let obsm_out = &mut obsm_slot;
            let obsp_out = &mut obsp_slot;
            let varm_out = &mut varm_slot;
            let varp_out = &mut varp_slot;
            let aux = &aux;
            let columns = &options.column_names;
            let x_main = &x_main;

            s.spawn(move |_| {
                *obs_out = Some(self.read_axis_table(Axis::Obs, columns.obs.as_ref()));
            });
            s.spawn(move |_| {
                *var_out = Some(self.read_axis_table(Axis::Var, columns.var.as_ref()));
            });
            s.spawn(move |_| *x_out = Some(self.read_csr(x_main)));
            for (out, (_, array)) in x_extra_slots.iter_mut().zip(&x_extra) {
                s.spawn(move |_| *out = Some(self.read_csr(array)));
            }
            s.spawn(move |_| {
                *obsm_out = Some(self.read_dense_group(Axis::Obs, AxisMatrices::Multi, &aux.obs.m));
            });
            s.spawn(move |_| {
                *obsp_out = Some(self.read_dense_group(Axis::Obs, AxisMatrices::Pairwise, &aux.obs.p));
            });
            s.spawn(move |_| {
                *varm_out = Some(self.read_dense_group(Axis::Var, AxisMatrices::Multi, &aux.var.m));
            });
            s.spawn(move |_| {
                *varp_out = Some(self.read_dense_group(Axis::Var, AxisMatrices::Pairwise, &aux.var.p));
            });
        });

        let obs = take_slot(obs_slot, "obs")?;
        let var = take_slot(var_slot, "var")?;
        let x = take_slot(x_slot, x_name)?;
        let mut x_layers = HashMap::with_capacity(x_extra.len());
        for ((name, _), slot) in x_extra.iter().zip(x_extra_slots) {
            x_layers.insert(name.clone(), take_slot(slot, name)?);
        }
        let mut result = AxisQueryResult {
            obs,
            var,
            x,
            x_layers,
            obsm: take_slot(obsm_slot, "obsm")?,
            obsp: take_slot(obsp_slot, "obsp")?,
            varm: take_slot(varm_slot, "varm")?,
            varp: take_slot(varp_slot, "varp")?,
        };
        if options.drop_levels {
            result.drop_unused_levels()?;
        }

        log::debug!(
            "materialized {} x {} in {:?}",
            result.n_obs(),
            result.n_vars(),
            started.elapsed()
        );
        Ok(result)
    }

    fn aux_layers(
        &self,
        axis: Axis,
        kind: AxisMatrices,
        names: &[String],
    ) -> Result<NamedLayers> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.aux_layer(axis, kind, name)?)))
            .collect()
    }

    /// Read one axis table. The same scan populates the join-id cache if
    /// it is still empty; otherwise the cached ids are kept.
    fn read_axis_table(&self, axis: Axis, columns: Option<&Vec<String>>) -> Result<RecordBatch> {
        let (projection, strip) = match columns {
            None => (None, false),
            Some(cols) if cols.iter().any(|c| c == SOMA_JOINID) => (Some(cols.clone()), false),
            Some(cols) => {
                let mut cols = cols.clone();
                cols.push(SOMA_JOINID.to_string());
                (Some(cols), true)
            }
        };
        let request = ScanRequest::for_axis(self.query(axis)).with_columns(projection);
        let frame = axis.get_from(&self.frames);

        let populated = self.joinids.resolve_with(axis, || {
            let table = ReadIter::new(frame.clone(), request.clone()).concat()?;
            Ok((joinid_column(&table)?, table))
        })?;
        let table = match populated {
            Some(table) => table,
            None => ReadIter::new(frame.clone(), request).concat()?,
        };
        if strip {
            strip_column(table, SOMA_JOINID)
        } else {
            Ok(table)
        }
    }

    fn read_csr(&self, array: &Arc<dyn SparseNDArray>) -> Result<CsrMatrix> {
        let obs_ids = self.obs_joinids()?;
        let var_ids = self.var_joinids()?;
        let shape = (obs_ids.len(), var_ids.len());
        let rows = self.indexer.index_for(Axis::Obs)?;
        let cols = self.indexer.index_for(Axis::Var)?;
        let request = ScanRequest::for_coords(vec![
            CoordSelector::Ids(obs_ids),
            CoordSelector::Ids(var_ids),
        ]);
        let read = SparseRead::new(array.clone(), request);
        CsrMatrix::from_coo_batches(read.tables(), shape, rows.as_ref(), cols.as_ref())
    }

    fn read_dense_group(
        &self,
        axis: Axis,
        kind: AxisMatrices,
        layers: &[(String, Arc<dyn SparseNDArray>)],
    ) -> Result<HashMap<String, DenseMatrix>> {
        let mut out = HashMap::with_capacity(layers.len());
        if layers.is_empty() {
            return Ok(out);
        }
        let ids = self.joinids(axis)?;
        let n = ids.len();
        let rows = self.indexer.index_for(axis)?;
        for (name, array) in layers {
            let matrix = match kind {
                AxisMatrices::Pairwise => {
                    let request = ScanRequest::for_coords(vec![
                        CoordSelector::Ids(ids.clone()),
                        CoordSelector::Ids(ids.clone()),
                    ]);
                    let read = SparseRead::new(array.clone(), request);
                    DenseMatrix::from_coo_batches(read.tables(), (n, n), rows.as_ref(), rows.as_ref())?
                }
                AxisMatrices::Multi => {
                    let request = ScanRequest::for_coords(vec![CoordSelector::Ids(ids.clone())]);
                    let batches = SparseRead::new(array.clone(), request)
                        .tables()
                        .collect::<Result<Vec<_>>>()?;
                    // width from the components actually read, bounded by the declared shape
                    let mut ncols = component_extent(&batches)?;
                    if let Some(&declared) = array.shape().get(1) {
                        ncols = ncols.min(usize::try_from(declared).unwrap_or(usize::MAX));
                    }
                    let cols = PositionalIndex::new(ncols);
                    DenseMatrix::from_coo_batches(
                        batches.into_iter().map(Ok),
                        (n, ncols),
                        rows.as_ref(),
                        &cols,
                    )?
                }
            };
            out.insert(name.clone(), matrix);
        }
        Ok(out)
    }

    // ========================================================================
    // Spatial scenes
    // ========================================================================

    /// Scenes containing at least one of the queried `obs` rows.
    pub fn obs_scene_ids(&self) -> Result<Vec<String>> {
        let frame = self
            .obs_spatial_presence
            .clone()
            .ok_or_else(|| QueryError::CollectionNotFound("obs_spatial_presence".to_string()))?;
        self.scene_ids(Axis::Obs, frame)
    }

    /// Scenes containing at least one of the queried `var` rows.
    pub fn var_scene_ids(&self) -> Result<Vec<String>> {
        let frame = self
            .measurement
            .var_spatial_presence
            .clone()
            .ok_or_else(|| QueryError::CollectionNotFound("var_spatial_presence".to_string()))?;
        self.scene_ids(Axis::Var, frame)
    }

    fn scene_ids(&self, axis: Axis, frame: Arc<dyn DataFrame>) -> Result<Vec<String>> {
        let request = ScanRequest::for_coords(vec![CoordSelector::Ids(self.joinids(axis)?)])
            .with_columns(Some(vec![SCENE_ID.to_string()]))
            .with_value_filter(Filter::compare(PRESENCE_DATA, CompareOp::NotEqual, 0i64))
            .with_result_order(ResultOrder::ColumnMajor);
        let table = ReadIter::new(frame, request).concat()?;
        let column = table
            .column_by_name(SCENE_ID)
            .ok_or_else(|| QueryError::ColumnNotFound(SCENE_ID.to_string()))?;
        let column = cast(column, &DataType::Utf8)?;

        let mut seen = AHashSet::new();
        let mut scenes = Vec::new();
        for scene in column.as_string::<i32>().iter().flatten() {
            if seen.insert(scene) {
                scenes.push(scene.to_string());
            }
        }
        Ok(scenes)
    }

    /// Release the query. Cached join ids stay readable; calling this more
    /// than once is harmless.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("closed axis query on measurement '{}'", self.measurement_name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ExperimentAxisQuery {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ExperimentAxisQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentAxisQuery")
            .field("measurement", &self.measurement_name)
            .field("obs_cached", &self.joinids.is_cached(Axis::Obs))
            .field("var_cached", &self.joinids.is_cached(Axis::Var))
            .field("indexer", &self.indexer)
            .finish()
    }
}

/// Look up a sparse member of a layer collection.
fn sparse_member(
    collection: &Collection<Layer>,
    collection_name: &str,
    name: &str,
) -> Result<Arc<dyn SparseNDArray>> {
    if name.is_empty() {
        return Err(QueryError::InvalidArgument(format!(
            "empty layer name for {}",
            collection_name
        )));
    }
    let layer = collection.get(name).ok_or_else(|| QueryError::LayerNotFound {
        collection: collection_name.to_string(),
        layer: name.to_string(),
    })?;
    match layer {
        Layer::Sparse(array) => Ok(array.clone()),
        Layer::Dense(_) => Err(QueryError::WrongKind {
            collection: collection_name.to_string(),
            layer: name.to_string(),
            expected: LayerKind::Sparse,
            actual: layer.kind(),
        }),
    }
}
