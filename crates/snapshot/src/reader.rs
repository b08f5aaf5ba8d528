//! Reads snapshot tables from Parquet files.

use crate::types::{SnapshotSummary, SnapshotTable};
use arrow::array::{Array, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::path::Path;

/// Static methods for reading snapshot data from Parquet files.
pub struct SnapshotReader;

impl SnapshotReader {
    /// Read a full snapshot table.
    ///
    /// `group_key` names the column holding the time label. Every other
    /// numeric column becomes a feature, in schema order. Non-numeric columns
    /// are ignored.
    pub fn read_all(path: &Path, group_key: &str) -> anyhow::Result<SnapshotTable> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();

        let group_idx = schema
            .index_of(group_key)
            .map_err(|_| anyhow::anyhow!("Column '{group_key}' not found in {}", path.display()))?;
        let feature_cols: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, f)| *i != group_idx && f.data_type().is_numeric())
            .map(|(i, _)| i)
            .collect();
        if feature_cols.is_empty() {
            anyhow::bail!("No numeric feature columns in {}", path.display());
        }
        let feature_names = feature_cols
            .iter()
            .map(|&i| schema.field(i).name().clone())
            .collect();

        let mut table = SnapshotTable::new(feature_names);
        let reader = builder.build()?;
        for batch_result in reader {
            let batch = batch_result?;
            append_batch(&mut table, &batch, group_idx, &feature_cols)?;
        }

        tracing::debug!(
            rows = table.len(),
            dim = table.dim(),
            path = %path.display(),
            "Read snapshot table"
        );

        Ok(table)
    }

    /// Compute per-group counts for a snapshot Parquet file.
    pub fn read_summary(path: &Path, group_key: &str) -> anyhow::Result<SnapshotSummary> {
        Ok(Self::read_all(path, group_key)?.summary())
    }
}

/// Cast a column to `Float64Array`, rejecting nulls.
fn column_as_f64(batch: &RecordBatch, idx: usize) -> anyhow::Result<Float64Array> {
    let column = cast(batch.column(idx), &DataType::Float64)?;
    let values = column
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| anyhow::anyhow!("Column {idx} could not be read as Float64"))?
        .clone();
    if values.null_count() > 0 {
        anyhow::bail!("Column {idx} contains {} null values", values.null_count());
    }
    Ok(values)
}

/// Append all rows of one Arrow RecordBatch to the table.
fn append_batch(
    table: &mut SnapshotTable,
    batch: &RecordBatch,
    group_idx: usize,
    feature_cols: &[usize],
) -> anyhow::Result<()> {
    let groups = column_as_f64(batch, group_idx)?;
    let features = feature_cols
        .iter()
        .map(|&i| column_as_f64(batch, i))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut row = vec![0.0_f32; feature_cols.len()];
    for r in 0..batch.num_rows() {
        for (slot, column) in row.iter_mut().zip(&features) {
            *slot = column.value(r) as f32;
        }
        table.push(groups.value(r), &row)?;
    }
    Ok(())
}
