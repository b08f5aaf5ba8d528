//! Parquet I/O for snapshot population data.
//!
//! Provides the in-memory snapshot table (unpaired samples labelled by time
//! group) and reading/writing it, plus generated trajectories, as Parquet files.

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::SnapshotReader;
pub use types::{
    default_feature_names, GroupCount, SnapshotSummary, SnapshotTable, TrajectoryFrame,
    DEFAULT_GROUP_KEY,
};
pub use writer::SnapshotWriter;
