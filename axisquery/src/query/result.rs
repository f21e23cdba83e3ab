//! Materialized query result

use std::collections::HashMap;

use arrow::array::{make_array, Array, ArrayRef, AsArray, Int64Array, UInt32Array};
use arrow::compute::{cast, take};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;

use super::csr::{CsrMatrix, DenseMatrix};
use crate::Result;

/// Everything a materializing read returns, in memory.
#[derive(Debug, Clone)]
pub struct AxisQueryResult {
    /// `obs` rows, in join-id order
    pub obs: RecordBatch,
    /// `var` rows, in join-id order
    pub var: RecordBatch,
    /// The requested X layer, `n_obs × n_vars`
    pub x: CsrMatrix,
    /// Additional X layers by name
    pub x_layers: HashMap<String, CsrMatrix>,
    pub obsm: HashMap<String, DenseMatrix>,
    pub obsp: HashMap<String, DenseMatrix>,
    pub varm: HashMap<String, DenseMatrix>,
    pub varp: HashMap<String, DenseMatrix>,
}

impl AxisQueryResult {
    pub fn n_obs(&self) -> usize {
        self.obs.num_rows()
    }

    pub fn n_vars(&self) -> usize {
        self.var.num_rows()
    }

    /// Remove dictionary categories no longer referenced by either table.
    pub fn drop_unused_levels(&mut self) -> Result<()> {
        self.obs = drop_unused_categories(&self.obs)?;
        self.var = drop_unused_categories(&self.var)?;
        Ok(())
    }
}

/// Rewrite every dictionary column of `batch` so its values only contain
/// categories that some row refers to. Surviving categories keep their
/// relative order; key type and column type are unchanged.
pub fn drop_unused_categories(batch: &RecordBatch) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .map(drop_unused_values)
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

fn drop_unused_values(array: &ArrayRef) -> Result<ArrayRef> {
    let DataType::Dictionary(key_type, _) = array.data_type() else {
        return Ok(array.clone());
    };
    let dict = array.as_any_dictionary();
    let keys = dict.keys();
    let normalized = dict.normalized_keys();

    let mut used = vec![false; dict.values().len()];
    for (i, &k) in normalized.iter().enumerate() {
        if keys.is_valid(i) {
            used[k] = true;
        }
    }
    if used.iter().all(|&u| u) {
        return Ok(array.clone());
    }

    let mut remap = vec![0i64; used.len()];
    let mut kept = Vec::new();
    for (old, &u) in used.iter().enumerate() {
        if u {
            remap[old] = kept.len() as i64;
            kept.push(old as u32);
        }
    }
    let values = take(dict.values().as_ref(), &UInt32Array::from(kept), None)?;

    let new_keys: Int64Array = normalized
        .iter()
        .enumerate()
        .map(|(i, &k)| keys.is_valid(i).then(|| remap[k]))
        .collect();
    let new_keys = cast(&new_keys, key_type)?;

    let data = new_keys
        .to_data()
        .into_builder()
        .data_type(array.data_type().clone())
        .child_data(vec![values.to_data()])
        .build()?;
    Ok(make_array(data))
}

/// Drop column `name` from `batch` if present.
pub(crate) fn strip_column(batch: RecordBatch, name: &str) -> Result<RecordBatch> {
    let schema = batch.schema();
    let Ok(drop) = schema.index_of(name) else {
        return Ok(batch);
    };
    let keep: Vec<usize> = (0..schema.fields().len()).filter(|&i| i != drop).collect();
    Ok(batch.project(&keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{DictionaryArray, Int16Array, StringArray};
    use arrow::datatypes::{Field, Int16Type, Int8Type, Schema};
    use std::sync::Arc;

    fn labels(batch: &RecordBatch, i: usize) -> (Vec<Option<i16>>, Vec<String>) {
        let dict = batch.column(i).as_dictionary::<Int16Type>();
        let keys = dict.keys().iter().collect();
        let values = dict
            .values()
            .as_string::<i32>()
            .iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        (keys, values)
    }

    #[test]
    fn test_drop_unused_categories_preserves_order() {
        let values = StringArray::from(vec!["T", "B", "NK", "Mono"]);
        let dict = DictionaryArray::<Int16Type>::try_new(
            Int16Array::from(vec![Some(3), None, Some(1), Some(3)]),
            Arc::new(values),
        )
        .unwrap();
        let schema = Arc::new(Schema::new(vec![
            Field::new("cell_type", dict.data_type().clone(), true),
            Field::new("n", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(dict), Arc::new(Int64Array::from(vec![1, 2, 3, 4]))],
        )
        .unwrap();

        let dropped = drop_unused_categories(&batch).unwrap();
        assert_eq!(dropped.schema(), schema);
        let (keys, values) = labels(&dropped, 0);
        assert_eq!(values, vec!["B", "Mono"]);
        assert_eq!(keys, vec![Some(1), None, Some(0), Some(1)]);
        assert_eq!(dropped.column(1), batch.column(1));
    }

    #[test]
    fn test_fully_used_dictionary_untouched() {
        let dict: DictionaryArray<Int8Type> = vec!["a", "b", "a"].into_iter().collect();
        let schema = Arc::new(Schema::new(vec![Field::new(
            "label",
            dict.data_type().clone(),
            false,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(dict)]).unwrap();
        let dropped = drop_unused_categories(&batch).unwrap();
        assert_eq!(dropped, batch);
    }

    #[test]
    fn test_strip_column() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("soma_joinid", DataType::Int64, false),
            Field::new("n", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0, 1])),
                Arc::new(Int64Array::from(vec![5, 6])),
            ],
        )
        .unwrap();
        let stripped = strip_column(batch.clone(), "soma_joinid").unwrap();
        assert_eq!(stripped.num_columns(), 1);
        assert_eq!(stripped.schema().field(0).name(), "n");
        assert_eq!(strip_column(stripped.clone(), "soma_joinid").unwrap(), stripped);
    }
}
