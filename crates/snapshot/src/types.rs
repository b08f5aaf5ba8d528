//! Data types for snapshot tables and generated trajectories.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default name of the column holding the time label of each row.
pub const DEFAULT_GROUP_KEY: &str = "samples";

/// Feature column names `d1..dn`, used when a table is built in memory.
pub fn default_feature_names(dim: usize) -> Vec<String> {
    (1..=dim).map(|i| format!("d{i}")).collect()
}

/// Unpaired population samples, one row per measured point.
///
/// Each row carries the discrete time label (group) it was measured at and a
/// dense feature vector. Features are stored row-major in a single buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTable {
    feature_names: Vec<String>,
    groups: Vec<f64>,
    features: Vec<f32>,
}

impl SnapshotTable {
    /// Create an empty table with the given feature columns.
    pub fn new(feature_names: Vec<String>) -> Self {
        Self {
            feature_names,
            groups: Vec::new(),
            features: Vec::new(),
        }
    }

    /// Create an empty table with `d1..dn` feature columns.
    pub fn with_dim(dim: usize) -> Self {
        Self::new(default_feature_names(dim))
    }

    /// Append a row. Fails if the feature vector has the wrong length or the
    /// group label is not finite.
    pub fn push(&mut self, group: f64, features: &[f32]) -> anyhow::Result<()> {
        if features.len() != self.dim() {
            anyhow::bail!(
                "row has {} features, table expects {}",
                features.len(),
                self.dim()
            );
        }
        if !group.is_finite() {
            anyhow::bail!("group label must be finite, got {group}");
        }
        self.groups.push(group);
        self.features.extend_from_slice(features);
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of feature columns.
    pub fn dim(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Group label of row `i`.
    pub fn group(&self, i: usize) -> f64 {
        self.groups[i]
    }

    /// Feature vector of row `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        let d = self.dim();
        &self.features[i * d..(i + 1) * d]
    }

    /// Sorted distinct group labels.
    pub fn distinct_groups(&self) -> Vec<f64> {
        let mut groups = self.groups.clone();
        groups.sort_by(f64::total_cmp);
        groups.dedup();
        groups
    }

    /// Row indices belonging to `group`, in table order.
    pub fn rows_for_group(&self, group: f64) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, &g)| g == group)
            .map(|(i, _)| i)
            .collect()
    }

    /// Per-group row counts and dimension.
    pub fn summary(&self) -> SnapshotSummary {
        let mut counts: BTreeMap<u64, (f64, usize)> = BTreeMap::new();
        for &g in &self.groups {
            counts.entry(ordered_key(g)).or_insert((g, 0)).1 += 1;
        }
        SnapshotSummary {
            total_rows: self.len(),
            dim: self.dim(),
            groups: counts
                .into_values()
                .map(|(group, count)| GroupCount { group, count })
                .collect(),
        }
    }
}

/// Map an f64 to a u64 whose unsigned order matches the float order.
fn ordered_key(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Row count for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCount {
    pub group: f64,
    pub count: usize,
}

/// Quick statistics from a snapshot table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Total number of rows.
    pub total_rows: usize,
    /// Number of feature columns.
    pub dim: usize,
    /// Row counts per group, ascending by group.
    pub groups: Vec<GroupCount>,
}

/// Points of many trajectories evaluated at a single time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryFrame {
    /// Time the points were evaluated at.
    pub time: f64,
    /// One feature vector per trajectory; index = trajectory id.
    pub points: Vec<Vec<f32>>,
}
