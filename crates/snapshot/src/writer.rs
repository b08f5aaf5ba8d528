//! Writes snapshot tables and generated trajectories to Parquet files using Arrow.

use crate::types::{SnapshotTable, TrajectoryFrame};
use arrow::array::{ArrayRef, Float32Array, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::path::Path;
use std::sync::Arc;

/// Arrow schema for a snapshot table: the group column then one Float32 column per feature.
pub fn snapshot_schema(group_key: &str, feature_names: &[String]) -> Schema {
    let mut fields = vec![Field::new(group_key, DataType::Float64, false)];
    fields.extend(
        feature_names
            .iter()
            .map(|name| Field::new(name, DataType::Float32, false)),
    );
    Schema::new(fields)
}

/// Arrow schema for generated trajectories: `time`, `trajectory`, then features.
pub fn trajectory_schema(feature_names: &[String]) -> Schema {
    let mut fields = vec![
        Field::new("time", DataType::Float64, false),
        Field::new("trajectory", DataType::UInt64, false),
    ];
    fields.extend(
        feature_names
            .iter()
            .map(|name| Field::new(name, DataType::Float32, false)),
    );
    Schema::new(fields)
}

/// Static methods for writing Parquet files.
pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Write a snapshot table, naming the group column `group_key`.
    pub fn write_table(path: &Path, table: &SnapshotTable, group_key: &str) -> anyhow::Result<()> {
        let schema = Arc::new(snapshot_schema(group_key, table.feature_names()));

        let groups: Float64Array = (0..table.len()).map(|i| Some(table.group(i))).collect();
        let mut columns: Vec<ArrayRef> = vec![Arc::new(groups)];
        for j in 0..table.dim() {
            let values: Float32Array = (0..table.len()).map(|i| Some(table.row(i)[j])).collect();
            columns.push(Arc::new(values));
        }

        write_batch(path, schema, columns)?;
        tracing::info!(
            rows = table.len(),
            path = %path.display(),
            "Wrote snapshot Parquet file"
        );
        Ok(())
    }

    /// Write trajectory frames in long format: one row per (time, trajectory).
    ///
    /// All frames must carry the same number of points with `feature_names.len()`
    /// features each.
    pub fn write_trajectories(
        path: &Path,
        frames: &[TrajectoryFrame],
        feature_names: &[String],
    ) -> anyhow::Result<()> {
        let dim = feature_names.len();
        let n_traj = frames.first().map(|f| f.points.len()).unwrap_or(0);
        for frame in frames {
            if frame.points.len() != n_traj {
                anyhow::bail!(
                    "frame at t={} has {} points, expected {n_traj}",
                    frame.time,
                    frame.points.len()
                );
            }
            if let Some(p) = frame.points.iter().find(|p| p.len() != dim) {
                anyhow::bail!("frame at t={} has a point of dim {}, expected {dim}", frame.time, p.len());
            }
        }

        let schema = Arc::new(trajectory_schema(feature_names));
        let rows = || {
            frames
                .iter()
                .flat_map(|f| f.points.iter().enumerate().map(move |(id, p)| (f.time, id, p)))
        };

        let times: Float64Array = rows().map(|(t, _, _)| Some(t)).collect();
        let ids: UInt64Array = rows().map(|(_, id, _)| Some(id as u64)).collect();
        let mut columns: Vec<ArrayRef> = vec![Arc::new(times), Arc::new(ids)];
        for j in 0..dim {
            let values: Float32Array = rows().map(|(_, _, p)| Some(p[j])).collect();
            columns.push(Arc::new(values));
        }

        write_batch(path, schema, columns)?;
        tracing::info!(
            frames = frames.len(),
            trajectories = n_traj,
            path = %path.display(),
            "Wrote trajectory Parquet file"
        );
        Ok(())
    }
}

fn write_batch(path: &Path, schema: Arc<Schema>, columns: Vec<ArrayRef>) -> anyhow::Result<()> {
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let file = std::fs::File::create(path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}
